//! End-to-end broker tests over real TCP connections.

mod test_harness;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use geard::broker::job::Priority;
use geard::client::{Client, WorkEvent};
use geard::worker::{Concurrency, Worker, WorkerJob};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::timeout;

use test_harness::{assert_eventually, spawn_broker, spawn_broker_at};

async fn spawn_echo_worker(addr: &str, function: &str) -> Worker {
    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(addr);
    worker
        .add_func(function, 0, |job: WorkerJob| async move {
            Ok(job.data().to_vec())
        })
        .await
        .unwrap();
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });
    worker
}

#[tokio::test]
async fn basic_dispatch() {
    let broker = spawn_broker().await;
    let worker = spawn_echo_worker(&broker.addr, "square").await;

    let client = Client::connect(&broker.addr).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = client
        .submit("square", b"5", Priority::Normal, move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();
    assert!(handle.starts_with("H:"));

    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("response in time")
        .expect("handler event");
    match event {
        WorkEvent::Complete(data) => assert_eq!(data, b"5"),
        other => panic!("expected completion, got {other:?}"),
    }

    assert_eq!(broker.broker.queued_total(), 0);
    assert_eq!(broker.broker.running_total(), 0);
    worker.close().await;
}

#[tokio::test]
async fn priority_ordering_strict_high_to_low() {
    let broker = spawn_broker().await;
    let client = Client::connect(&broker.addr).await.unwrap();

    // Queue LOW, NORMAL, HIGH in that wall-clock order, no worker yet.
    client
        .submit_background("prio", b"a", Priority::Low)
        .await
        .unwrap();
    client
        .submit_background("prio", b"b", Priority::Normal)
        .await
        .unwrap();
    client
        .submit_background("prio", b"c", Priority::High)
        .await
        .unwrap();
    assert_eq!(broker.broker.queued_total(), 3);

    // A serial worker drains them; order must be HIGH, NORMAL, LOW.
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(Concurrency::OneByOne);
    worker.add_server(&broker.addr);
    {
        let order = order.clone();
        worker
            .add_func("prio", 0, move |job: WorkerJob| {
                let order = order.clone();
                async move {
                    order
                        .lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(job.data()).into_owned());
                    Ok(Vec::new())
                }
            })
            .await
            .unwrap();
    }
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });

    assert_eventually(
        || order.lock().unwrap().len() == 3,
        Duration::from_secs(5),
        "worker should drain all three jobs",
    )
    .await;
    assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    worker.close().await;
}

#[tokio::test]
async fn coalescing_returns_first_handle_and_payload() {
    let broker = spawn_broker().await;
    let first = Client::connect(&broker.addr).await.unwrap();
    let second = Client::connect(&broker.addr).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let h1 = first
        .submit_unique("x", "u", b"P1", Priority::Normal, move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();
    let h2 = second
        .submit_unique("x", "u", b"P2", Priority::Normal, |_| {})
        .await
        .unwrap();
    assert_eq!(h1, h2);
    assert_eq!(broker.broker.queued_total(), 1);

    let executed: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(&broker.addr);
    {
        let executed = executed.clone();
        worker
            .add_func("x", 0, move |job: WorkerJob| {
                let executed = executed.clone();
                async move {
                    executed.lock().unwrap().push(job.data().to_vec());
                    Ok(job.data().to_vec())
                }
            })
            .await
            .unwrap();
    }
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });

    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("response in time")
        .expect("handler event");
    assert!(matches!(event, WorkEvent::Complete(ref data) if data == b"P1"));

    // Give a straggler assignment a moment to show up; none should.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*executed.lock().unwrap(), vec![b"P1".to_vec()]);
    worker.close().await;
}

#[tokio::test]
async fn background_jobs_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    let first = spawn_broker_at(dir.path()).await;
    let client = Client::connect(&first.addr).await.unwrap();
    let handle = client
        .submit_background("x", b"durable-data", Priority::Normal)
        .await
        .unwrap();
    assert!(handle.starts_with("H:"));
    drop(client);
    first.stop().await;
    // Let session tasks release the store before reopening.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = spawn_broker_at(dir.path()).await;
    assert_eq!(second.broker.queued_total(), 1);

    let executed: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(&second.addr);
    {
        let executed = executed.clone();
        worker
            .add_func("x", 0, move |job: WorkerJob| {
                let executed = executed.clone();
                async move {
                    executed.lock().unwrap().push(job.data().to_vec());
                    Ok(Vec::new())
                }
            })
            .await
            .unwrap();
    }
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });

    assert_eventually(
        || executed.lock().unwrap().len() == 1,
        Duration::from_secs(5),
        "replayed job should reach the worker",
    )
    .await;
    assert_eq!(executed.lock().unwrap()[0], b"durable-data");

    // Completion purges the record; nothing replays on the next start.
    assert_eventually(
        || second.broker.store.is_empty(),
        Duration::from_secs(5),
        "record should be purged after completion",
    )
    .await;
    worker.close().await;
}

#[tokio::test]
async fn function_timeout_fails_the_job() {
    let broker = spawn_broker().await;

    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(&broker.addr);
    worker
        .add_func("slow", 1, |_job: WorkerJob| async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(Vec::new())
        })
        .await
        .unwrap();
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });

    let client = Client::connect(&broker.addr).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let started = tokio::time::Instant::now();
    let handle = client
        .submit("slow", b"", Priority::Normal, move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("failure within the timeout window")
        .expect("handler event");
    assert!(matches!(event, WorkEvent::Fail));
    assert!(started.elapsed() >= Duration::from_millis(900));

    // Registry entry is gone once the failure lands.
    assert!(!broker.broker.job_status(&handle).known);
    worker.close().await;
}

#[tokio::test]
async fn status_query_tracks_progress_and_unknown_handles() {
    let broker = spawn_broker().await;
    let client = Client::connect(&broker.addr).await.unwrap();

    let unknown = client.status("H:nowhere:1").await.unwrap();
    assert!(!unknown.known);
    assert!(!unknown.running);

    let handle = client
        .submit_background("queued-fn", b"data", Priority::Normal)
        .await
        .unwrap();
    let queued = client.status(&handle).await.unwrap();
    assert!(queued.known);
    assert!(!queued.running);
}

#[tokio::test]
async fn echo_round_trips() {
    let broker = spawn_broker().await;
    let client = Client::connect(&broker.addr).await.unwrap();
    let data = client.echo(b"ping \x00 pong").await.unwrap();
    assert_eq!(data, b"ping \x00 pong");
}

async fn admin_command(addr: &str, command: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(command.as_bytes()).await.unwrap();
    let mut response = String::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("admin response in time")
            .unwrap();
        if n == 0 {
            break;
        }
        response.push_str(&String::from_utf8_lossy(&buf[..n]));
        if response.ends_with(".\n") || response.starts_with("OK") || response.starts_with("ERR") {
            break;
        }
    }
    response
}

#[tokio::test]
async fn admin_status_counts_queued_running_workers() {
    let broker = spawn_broker().await;
    let client = Client::connect(&broker.addr).await.unwrap();

    // One serial worker blocks on the HIGH job while two LOW jobs queue up.
    let release = Arc::new(Notify::new());
    let worker = Worker::new(Concurrency::OneByOne);
    worker.add_server(&broker.addr);
    {
        let release = release.clone();
        worker
            .add_func("adm", 0, move |_job: WorkerJob| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok(Vec::new())
                }
            })
            .await
            .unwrap();
    }
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });

    client
        .submit_background("adm", b"h", Priority::High)
        .await
        .unwrap();
    {
        let broker = broker.broker.clone();
        assert_eventually(
            || broker.running_total() == 1,
            Duration::from_secs(5),
            "worker should pick up the high job",
        )
        .await;
    }
    client
        .submit_background("adm", b"l1", Priority::Low)
        .await
        .unwrap();
    client
        .submit_background("adm", b"l2", Priority::Low)
        .await
        .unwrap();

    let status = admin_command(&broker.addr, "status\n").await;
    assert!(
        status.contains("adm\t3\t1\t1"),
        "unexpected status output: {status:?}"
    );

    release.notify_waiters();
    worker.close().await;
}

#[tokio::test]
async fn admin_version_and_workers() {
    let broker = spawn_broker().await;

    let version = admin_command(&broker.addr, "version\n").await;
    assert!(version.starts_with("OK "));

    let worker = spawn_echo_worker(&broker.addr, "listed").await;
    worker.set_id("w-1").await;
    {
        let broker = broker.broker.clone();
        assert_eventually(
            || broker.workers_for_function("listed").len() == 1,
            Duration::from_secs(5),
            "worker should register",
        )
        .await;
    }

    let workers = admin_command(&broker.addr, "workers\n").await;
    assert!(workers.contains("listed"), "workers output: {workers:?}");
    assert!(workers.ends_with(".\n"));
    worker.close().await;
}

#[tokio::test]
async fn unknown_admin_command_errors() {
    let broker = spawn_broker().await;
    let response = admin_command(&broker.addr, "frobnicate\n").await;
    assert!(response.starts_with("ERR unknown_command"));
}

#[tokio::test]
async fn worker_exception_reaches_client() {
    let broker = spawn_broker().await;

    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(&broker.addr);
    worker
        .add_func("explode", 0, |_job: WorkerJob| async move {
            Err(geard::worker::WorkError::Exception(b"bad input".to_vec()))
        })
        .await
        .unwrap();
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });

    let client = Client::connect(&broker.addr).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .submit("explode", b"x", Priority::Normal, move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("response in time")
        .expect("handler event");
    assert!(matches!(event, WorkEvent::Exception(ref data) if data == b"bad input"));
    worker.close().await;
}

#[tokio::test]
async fn panicking_handler_reports_exception() {
    let broker = spawn_broker().await;

    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(&broker.addr);
    worker
        .add_func("kaboom", 0, |job: WorkerJob| async move {
            if job.data() == b"x" {
                panic!("handler exploded");
            }
            Ok(Vec::new())
        })
        .await
        .unwrap();
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });

    let client = Client::connect(&broker.addr).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .submit("kaboom", b"x", Priority::Normal, move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("response in time")
        .expect("handler event");
    assert!(
        matches!(event, WorkEvent::Exception(ref data) if data == b"handler exploded"),
        "got {event:?}"
    );
    worker.close().await;
}

#[tokio::test]
async fn progress_updates_flow_to_client_and_status() {
    let broker = spawn_broker().await;

    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(&broker.addr);
    worker
        .add_func("steps", 0, |job: WorkerJob| async move {
            job.update_status(1, 2).await.ok();
            job.send_data(b"halfway").await.ok();
            job.update_status(2, 2).await.ok();
            Ok(b"done".to_vec())
        })
        .await
        .unwrap();
    let runner = worker.clone();
    tokio::spawn(async move {
        let _ = runner.work().await;
    });

    let client = Client::connect(&broker.addr).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .submit("steps", b"", Priority::Normal, move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();

    let mut saw_status = false;
    let mut saw_data = false;
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("events in time")
            .expect("handler event");
        match event {
            WorkEvent::Status { .. } => saw_status = true,
            WorkEvent::Data(ref data) => {
                assert_eq!(data, b"halfway");
                saw_data = true;
            }
            WorkEvent::Complete(ref data) => {
                assert_eq!(data, b"done");
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_status);
    assert!(saw_data);
    worker.close().await;
}
