//! Persistent store record round-trips and replay.

use geard::broker::job::Priority;
use geard::storage::{JobRecord, JobStore};
use tempfile::TempDir;

fn sample_record(function: &str) -> JobRecord {
    JobRecord {
        function: function.to_string(),
        priority: Priority::Normal,
        unique_id: "uid-1".to_string(),
        due_at: 0,
        cron: None,
        payload: b"payload".to_vec(),
    }
}

#[tokio::test]
async fn put_then_range_returns_record() {
    let dir = TempDir::new().unwrap();
    let store = JobStore::open(dir.path()).unwrap();

    let record = sample_record("resize");
    store.put("H:host:1", &record).await.unwrap();

    let mut seen = Vec::new();
    store
        .range(|handle, record| seen.push((handle, record)))
        .unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "H:host:1");
    assert_eq!(seen[0].1, record);
}

#[tokio::test]
async fn delete_removes_record() {
    let dir = TempDir::new().unwrap();
    let store = JobStore::open(dir.path()).unwrap();

    store.put("H:host:1", &sample_record("a")).await.unwrap();
    store.put("H:host:2", &sample_record("b")).await.unwrap();
    store.delete("H:host:1").unwrap();

    let mut handles = Vec::new();
    store.range(|handle, _| handles.push(handle)).unwrap();
    assert_eq!(handles, vec!["H:host:2"]);
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let record = JobRecord {
        function: "mail".to_string(),
        priority: Priority::High,
        unique_id: "uid-42".to_string(),
        due_at: 1_900_000_000,
        cron: Some("*/5 * * * *".to_string()),
        payload: vec![0, 159, 146, 150],
    };
    {
        let store = JobStore::open(dir.path()).unwrap();
        store.put("H:host:7", &record).await.unwrap();
    }

    let store = JobStore::open(dir.path()).unwrap();
    let mut seen = Vec::new();
    store.range(|handle, record| seen.push((handle, record))).unwrap();
    assert_eq!(seen, vec![("H:host:7".to_string(), record)]);
}

#[tokio::test]
async fn overwrite_replaces_record() {
    let dir = TempDir::new().unwrap();
    let store = JobStore::open(dir.path()).unwrap();

    store.put("H:host:1", &sample_record("first")).await.unwrap();
    store.put("H:host:1", &sample_record("second")).await.unwrap();

    let mut seen = Vec::new();
    store.range(|_, record| seen.push(record.function)).unwrap();
    assert_eq!(seen, vec!["second"]);
}
