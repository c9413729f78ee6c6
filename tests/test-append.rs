use filetail::{SinkEvent, TailCoordinator};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time;

const TIMEOUT_2_SEC: Duration = Duration::from_millis(2000);

fn append(path: &Path, data: &str) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(data.as_bytes()).unwrap();
    file.sync_all().unwrap();
}

async fn next_text(events: &mut mpsc::UnboundedReceiver<SinkEvent>) -> String {
    match time::timeout(TIMEOUT_2_SEC, events.recv()).await.unwrap() {
        Some(SinkEvent::Chunk(chunk)) => chunk.into_inner().1,
        other => panic!("expected a chunk, got {:?}", other),
    }
}

/// Waits until the tail is set up, so later appends are observed as growth.
async fn wait_until_tailing(tails: &TailCoordinator, path: &Path) {
    time::timeout(TIMEOUT_2_SEC, async {
        while !tails.is_tailing(path).await.unwrap() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
pub async fn test_hello_world() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("a.log");
    std::fs::write(&logfile, "hello\n").unwrap();

    let tails = TailCoordinator::new();
    let (sink, mut events) = mpsc::unbounded_channel();
    let source = tails.start_tail(&logfile, sink).unwrap();

    assert_eq!(next_text(&mut events).await, "hello\n");

    append(&logfile, "world\n");
    assert_eq!(next_text(&mut events).await, "world\n");

    tails.stop_tail(&logfile).unwrap();
    assert!(!tails.is_tailing(&source).await.unwrap());
    std::fs::remove_file(&logfile).unwrap();

    // The sink is dropped along with the worker; nothing else arrives
    let after = time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(!matches!(after, Ok(Some(_))), "unexpected event: {:?}", after);
}

#[tokio::test]
pub async fn test_empty_file() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("empty.log");
    std::fs::write(&logfile, "").unwrap();

    let tails = TailCoordinator::new();
    let (sink, mut events) = mpsc::unbounded_channel();
    tails.start_tail(&logfile, sink).unwrap();
    wait_until_tailing(&tails, &logfile).await;

    assert!(events.try_recv().is_err());

    append(&logfile, "first\n");
    assert_eq!(next_text(&mut events).await, "first\n");
}

#[tokio::test]
pub async fn test_appends_delivered_in_order_once() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("many.log");
    std::fs::write(&logfile, "").unwrap();

    let tails = TailCoordinator::new();
    let (sink, mut events) = mpsc::unbounded_channel();
    tails.start_tail(&logfile, sink).unwrap();
    wait_until_tailing(&tails, &logfile).await;

    let mut expected = String::new();
    for i in 0..50 {
        let line = format!("line {} ünïcödé\n", i);
        append(&logfile, &line);
        expected.push_str(&line);
        if i % 10 == 0 {
            time::sleep(Duration::from_millis(5)).await;
        }
    }

    let mut received = String::new();
    while received.len() < expected.len() {
        received.push_str(&next_text(&mut events).await);
    }
    assert_eq!(received, expected);

    // Duplicate notifications must not produce duplicate text
    let extra = time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(extra.is_err(), "unexpected event: {:?}", extra);

    let status = tails.status(&logfile).await.unwrap().unwrap();
    assert_eq!(status.offset, expected.len() as u64);
    assert_eq!(status.restarts, 0);
}

#[tokio::test]
pub async fn test_independent_files() {
    let logdir = tempdir().unwrap();
    let logfile1 = logdir.path().join("one.log");
    let logfile2 = logdir.path().join("two.log");
    std::fs::write(&logfile1, "one\n").unwrap();
    std::fs::write(&logfile2, "two\n").unwrap();

    let tails = TailCoordinator::new();
    let (sink1, mut events1) = mpsc::unbounded_channel();
    let (sink2, mut events2) = mpsc::unbounded_channel();
    tails.start_tail(&logfile1, sink1).unwrap();
    tails.start_tail(&logfile2, sink2).unwrap();

    assert_eq!(next_text(&mut events1).await, "one\n");
    assert_eq!(next_text(&mut events2).await, "two\n");

    tails.stop_tail(&logfile1).unwrap();
    append(&logfile2, "still here\n");
    assert_eq!(next_text(&mut events2).await, "still here\n");

    let mut active = tails.active_paths().await.unwrap();
    active.sort();
    assert_eq!(active.len(), 1);
    assert!(active[0].ends_with("two.log"));
}
