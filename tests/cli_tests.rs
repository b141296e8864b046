//! Command-line record loop: result printing and exit-status propagation.

mod test_harness;

use std::time::Duration;

use geard::broker::job::Priority;
use geard::cli;
use geard::client::Client;
use geard::error::GearError;
use geard::worker::{Concurrency, WorkError, Worker, WorkerJob};

use test_harness::spawn_broker;

/// Worker that echoes records back but fails any record equal to `bad`.
async fn spawn_picky_worker(addr: &str, function: &str) -> Worker {
    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(addr);
    worker
        .add_func(function, 0, |job: WorkerJob| async move {
            if job.data() == b"bad" {
                Err(WorkError::Fail)
            } else {
                Ok(job.data().to_vec())
            }
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
async fn final_record_failure_propagates_as_error() {
    let broker = spawn_broker().await;
    let worker = spawn_picky_worker(&broker.addr, "picky").await;
    let client = Client::connect(&broker.addr).await.unwrap();

    let result = cli::submit_records(
        &client,
        "picky",
        b"good\nbad\n",
        "\n",
        Duration::from_secs(5),
        Priority::Normal,
    )
    .await;
    assert!(matches!(result, Err(GearError::JobFailed(_))));
    worker.close().await;
}

#[tokio::test]
async fn final_record_success_clears_earlier_failures() {
    let broker = spawn_broker().await;
    let worker = spawn_picky_worker(&broker.addr, "picky2").await;
    let client = Client::connect(&broker.addr).await.unwrap();

    let result = cli::submit_records(
        &client,
        "picky2",
        b"bad\ngood\n",
        "\n",
        Duration::from_secs(5),
        Priority::Normal,
    )
    .await;
    assert!(result.is_ok());
    worker.close().await;
}

#[tokio::test]
async fn all_clean_records_succeed() {
    let broker = spawn_broker().await;
    let worker = spawn_picky_worker(&broker.addr, "picky3").await;
    let client = Client::connect(&broker.addr).await.unwrap();

    let result = cli::submit_records(
        &client,
        "picky3",
        b"1\n2\n3\n",
        "\n",
        Duration::from_secs(5),
        Priority::Normal,
    )
    .await;
    assert!(result.is_ok());
    worker.close().await;
}

#[tokio::test]
async fn unserved_record_times_out_and_errors() {
    let broker = spawn_broker().await;
    let client = Client::connect(&broker.addr).await.unwrap();

    // No worker registered, so the record never completes.
    let result = cli::submit_records(
        &client,
        "nobody-home",
        b"stuck\n",
        "\n",
        Duration::from_millis(300),
        Priority::Normal,
    )
    .await;
    assert!(matches!(result, Err(GearError::TimedOut)));
}
