//! JSONL sink for `ipblocker`. Appends one block event per line, for firewall scripts and log
//! shippers that tail a file.
//!
//! ```json
//! {"kind":"blocked","ip":"203.0.113.7"}
//! {"kind":"unblocked","ip":"203.0.113.7"}
//! ```

use ipblocker::BlockEvent;
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    /// Sink appending to `path`, created on first event.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<BlockEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: BlockEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(path = %path.display(), kind = event.kind(), "block event written");
            Ok(())
        })
    }
}

fn event_to_json(event: &BlockEvent) -> serde_json::Value {
    json!({ "kind": event.kind(), "ip": event.address.to_string() })
}
