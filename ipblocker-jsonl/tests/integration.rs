use ipblocker::{BlockEvent, BlockRule, IpBlocker};
use ipblocker_jsonl::JsonlSink;
use std::time::Duration;
use tower_service::Service;

fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .expect("file")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocks.jsonl");
    let mut sink = JsonlSink::new(&path);

    sink.call(BlockEvent::blocked("203.0.113.7".parse().unwrap())).await.unwrap();
    sink.call(BlockEvent::unblocked("203.0.113.7".parse().unwrap())).await.unwrap();

    let written = lines(&path);
    assert_eq!(written.len(), 2);
    assert_eq!(written[0]["kind"], "blocked");
    assert_eq!(written[0]["ip"], "203.0.113.7");
    assert_eq!(written[1]["kind"], "unblocked");
}

#[tokio::test]
async fn records_blocker_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transitions.jsonl");
    let blocker = IpBlocker::in_memory(BlockRule::new(2, Duration::from_millis(100)).unwrap());
    blocker.subscribe_sink(JsonlSink::new(&path));

    for _ in 0..3 {
        blocker.check_address("198.51.100.20").await.unwrap();
    }
    assert_eq!(lines(&path).len(), 1);

    // Wait for the counter to expire and the unblock to be written.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while lines(&path).len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let written = lines(&path);
    assert_eq!(written.len(), 2, "{written:?}");
    assert_eq!(written[1]["kind"], "unblocked");
}

#[tokio::test]
async fn unwritable_path_surfaces_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = JsonlSink::new(dir.path().join("missing").join("events.jsonl"));
    let err = sink.call(BlockEvent::blocked("192.0.2.1".parse().unwrap())).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}
