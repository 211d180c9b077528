//! Block rule: threshold, sliding window, delay schedule and whitelist.
//!
//! Semantics:
//! - An address is blocked once its hit count reaches `count` (`hits >= count`).
//! - `duration` is the sliding window: every hit pushes the counter's expiry out again.
//! - With a [`DelaySchedule`], hits at or past `threshold` are delayed by
//!   `(hits - threshold) * step`. The schedule is all-or-nothing; a rule never carries half of it.
//! - `white_list` networks are exempt from counting entirely.
//!
//! ```rust
//! use ipblocker::BlockRule;
//! use std::time::Duration;
//!
//! let rule = BlockRule::builder()
//!     .count(20)
//!     .duration(Duration::from_secs(60))
//!     .delay(5, Duration::from_secs(1))
//!     .allow("10.0.0.0/8")
//!     .build()
//!     .unwrap();
//! assert!(rule.is_blocked(20));
//! assert_eq!(rule.delay_for(7), Duration::from_secs(2));
//! ```

use crate::address::NetworkSpec;
use std::time::Duration;

/// Graduated delay applied before the block threshold is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelaySchedule {
    /// Hit count at which delaying starts.
    pub threshold: u64,
    /// Delay added per hit past `threshold`.
    pub step: Duration,
}

/// Validated blocking rule.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawBlockRule", into = "RawBlockRule"))]
pub struct BlockRule {
    count: u64,
    duration: Duration,
    delay: Option<DelaySchedule>,
    white_list: Option<Vec<NetworkSpec>>,
}

/// Errors produced when validating a rule.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// `count` must be > 0.
    #[error("count must be > 0 (got {0})")]
    InvalidCount(u64),
    /// `duration` must be > 0.
    #[error("duration must be > 0 (got {0:?})")]
    InvalidDuration(Duration),
    /// `delay_threshold` and `delay` must be given together.
    #[error("delay threshold and delay must both be set or both be absent")]
    PartialDelay,
    /// The rule text was not valid JSON for a rule.
    #[error("invalid rule document: {0}")]
    Malformed(String),
}

impl BlockRule {
    /// Create a rule with no delay schedule and no whitelist.
    pub fn new(count: u64, duration: Duration) -> Result<Self, RuleError> {
        let rule = Self { count, duration, delay: None, white_list: None };
        rule.validate()?;
        Ok(rule)
    }

    /// Start a builder.
    pub fn builder() -> BlockRuleBuilder {
        BlockRuleBuilder::new()
    }

    /// Add a delay schedule.
    pub fn with_delay(mut self, threshold: u64, step: Duration) -> Self {
        self.delay = Some(DelaySchedule { threshold, step });
        self
    }

    /// Replace the whitelist.
    pub fn with_white_list<I, N>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NetworkSpec>,
    {
        self.white_list = Some(networks.into_iter().map(Into::into).collect());
        self
    }

    /// Parse and validate a JSON rule document.
    ///
    /// ```rust
    /// let rule = ipblocker::BlockRule::from_json_str(
    ///     r#"{"count":5,"duration_ms":10000,"delay_threshold":2,"delay_ms":100}"#,
    /// ).unwrap();
    /// assert!(rule.has_delay());
    /// ```
    #[cfg(feature = "serde")]
    pub fn from_json_str(raw: &str) -> Result<Self, RuleError> {
        serde_json::from_str(raw).map_err(|e| RuleError::Malformed(e.to_string()))
    }

    fn validate(&self) -> Result<(), RuleError> {
        if self.count == 0 {
            return Err(RuleError::InvalidCount(0));
        }
        if self.duration == Duration::ZERO {
            return Err(RuleError::InvalidDuration(self.duration));
        }
        Ok(())
    }

    /// Block threshold.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sliding window length.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Delay schedule, if any.
    pub fn delay(&self) -> Option<DelaySchedule> {
        self.delay
    }

    /// Whitelist entries as configured.
    pub fn white_list(&self) -> Option<&[NetworkSpec]> {
        self.white_list.as_deref()
    }

    /// Whether the rule carries a delay schedule.
    pub fn has_delay(&self) -> bool {
        self.delay.is_some()
    }

    /// `hits >= count`.
    pub fn is_blocked(&self, hits: u64) -> bool {
        hits >= self.count
    }

    /// Response delay for the given hit count; zero below the schedule threshold.
    pub fn delay_for(&self, hits: u64) -> Duration {
        match self.delay {
            Some(DelaySchedule { threshold, step }) if hits >= threshold => {
                let over = u32::try_from(hits - threshold).unwrap_or(u32::MAX);
                step.saturating_mul(over)
            }
            _ => Duration::ZERO,
        }
    }
}

/// Builder for [`BlockRule`].
#[derive(Debug, Clone)]
pub struct BlockRuleBuilder {
    count: u64,
    duration: Duration,
    delay: Option<DelaySchedule>,
    white_list: Option<Vec<NetworkSpec>>,
}

impl BlockRuleBuilder {
    /// Defaults: 20 hits per 60 seconds, no delay, no whitelist.
    pub fn new() -> Self {
        Self { count: 20, duration: Duration::from_secs(60), delay: None, white_list: None }
    }

    /// Set the block threshold. Must be > 0.
    pub fn count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    /// Set the sliding window. Must be > 0.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Delay responses by `step` per hit once `threshold` is reached.
    pub fn delay(mut self, threshold: u64, step: Duration) -> Self {
        self.delay = Some(DelaySchedule { threshold, step });
        self
    }

    /// Append one whitelisted network (CIDR text, bare address, or `IpNet`).
    pub fn allow<N: Into<NetworkSpec>>(mut self, network: N) -> Self {
        self.white_list.get_or_insert_with(Vec::new).push(network.into());
        self
    }

    /// Build the rule, validating inputs.
    pub fn build(self) -> Result<BlockRule, RuleError> {
        let rule = BlockRule {
            count: self.count,
            duration: self.duration,
            delay: self.delay,
            white_list: self.white_list,
        };
        rule.validate()?;
        Ok(rule)
    }
}

impl Default for BlockRuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire shape of a rule: durations in milliseconds, whitelist as strings.
#[cfg(feature = "serde")]
#[derive(serde::Deserialize, serde::Serialize)]
struct RawBlockRule {
    count: u64,
    duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay_threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    white_list: Option<Vec<String>>,
}

#[cfg(feature = "serde")]
impl TryFrom<RawBlockRule> for BlockRule {
    type Error = RuleError;

    fn try_from(raw: RawBlockRule) -> Result<Self, Self::Error> {
        let delay = match (raw.delay_threshold, raw.delay_ms) {
            (Some(threshold), Some(ms)) => {
                Some(DelaySchedule { threshold, step: Duration::from_millis(ms) })
            }
            (None, None) => None,
            _ => return Err(RuleError::PartialDelay),
        };
        let rule = BlockRule {
            count: raw.count,
            duration: Duration::from_millis(raw.duration_ms),
            delay,
            white_list: raw.white_list.map(|list| list.into_iter().map(NetworkSpec::Text).collect()),
        };
        rule.validate()?;
        Ok(rule)
    }
}

#[cfg(feature = "serde")]
impl From<BlockRule> for RawBlockRule {
    fn from(rule: BlockRule) -> Self {
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        RawBlockRule {
            count: rule.count,
            duration_ms: millis(rule.duration),
            delay_threshold: rule.delay.map(|d| d.threshold),
            delay_ms: rule.delay.map(|d| millis(d.step)),
            white_list: rule
                .white_list
                .map(|list| list.iter().map(ToString::to_string).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> BlockRule {
        BlockRule::new(5, Duration::from_secs(10)).unwrap().with_delay(2, Duration::from_millis(100))
    }

    #[test]
    fn rejects_zero_count() {
        let err = BlockRule::new(0, Duration::from_secs(1)).expect_err("zero count is invalid");
        assert_eq!(err, RuleError::InvalidCount(0));
    }

    #[test]
    fn rejects_zero_duration() {
        let err = BlockRule::builder().duration(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, RuleError::InvalidDuration(Duration::ZERO)));
    }

    #[test]
    fn blocked_at_threshold_boundary() {
        let rule = rule();
        assert!(!rule.is_blocked(0));
        assert!(!rule.is_blocked(4));
        assert!(rule.is_blocked(5));
        assert!(rule.is_blocked(6));
    }

    #[test]
    fn delay_grows_linearly_past_threshold() {
        let rule = rule();
        let delays: Vec<u128> = (0..=5).map(|c| rule.delay_for(c).as_millis()).collect();
        assert_eq!(delays, vec![0, 0, 0, 100, 200, 300]);
        assert!(rule.delay_for(50) > rule.delay_for(49));
    }

    #[test]
    fn no_schedule_means_no_delay() {
        let rule = BlockRule::new(5, Duration::from_secs(10)).unwrap();
        assert!(!rule.has_delay());
        for c in [0, 1, 5, 1_000, u64::MAX] {
            assert_eq!(rule.delay_for(c), Duration::ZERO);
        }
    }

    #[test]
    fn huge_counts_saturate() {
        let rule = rule();
        assert_eq!(rule.delay_for(u64::MAX), Duration::from_millis(100).saturating_mul(u32::MAX));
    }

    #[test]
    fn builder_collects_whitelist() {
        let rule = BlockRule::builder().allow("10.0.0.0/8").allow("fe80::/64").build().unwrap();
        let list = rule.white_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], NetworkSpec::Text("10.0.0.0/8".into()));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_rule_parses() {
        let rule = BlockRule::from_json_str(
            r#"{"count":5,"duration_ms":10000,"delay_threshold":2,"delay_ms":100,"white_list":["10.0.0.0/8"]}"#,
        )
        .unwrap();
        assert_eq!(rule.count(), 5);
        assert_eq!(rule.duration(), Duration::from_secs(10));
        assert_eq!(rule.delay_for(4), Duration::from_millis(200));
        assert_eq!(rule.white_list().map(<[NetworkSpec]>::len), Some(1));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_rule_requires_joint_delay() {
        let err =
            BlockRule::from_json_str(r#"{"count":5,"duration_ms":10000,"delay_ms":100}"#).unwrap_err();
        assert!(matches!(err, RuleError::Malformed(msg) if msg.contains("both")));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_rule_serializes_back() {
        let json = serde_json::to_value(rule()).unwrap();
        assert_eq!(json["count"], 5);
        assert_eq!(json["duration_ms"], 10_000);
        assert_eq!(json["delay_ms"], 100);
        assert!(json.get("white_list").is_none());
    }
}
