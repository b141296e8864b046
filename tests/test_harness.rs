//! Test harness for broker integration tests.
//!
//! Spawns independent brokers on ephemeral ports with their own storage
//! directories, so tests can run several brokers in one process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use geard::broker::server::GearServer;
use geard::broker::Broker;
use geard::config::ServerConfig;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub struct TestBroker {
    pub addr: String,
    pub broker: Arc<Broker>,
    handle: Option<JoinHandle<()>>,
    _dir: Option<TempDir>,
}

impl TestBroker {
    /// Graceful stop; waits for the accept loop to exit.
    #[allow(dead_code)]
    pub async fn stop(mut self) {
        self.broker.begin_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Broker with a throwaway storage directory.
#[allow(dead_code)]
pub async fn spawn_broker() -> TestBroker {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().to_path_buf();
    spawn_broker_inner(path, Some(dir)).await
}

/// Broker over an existing storage directory, for restart tests.
#[allow(dead_code)]
pub async fn spawn_broker_at(path: &Path) -> TestBroker {
    spawn_broker_inner(path.to_path_buf(), None).await
}

async fn spawn_broker_inner(storage: PathBuf, dir: Option<TempDir>) -> TestBroker {
    let config = ServerConfig::new("127.0.0.1:0", storage).with_web_addr(None);
    let server = GearServer::bind(config).await.expect("bind broker");
    let addr = server.local_addr().expect("local addr").to_string();
    let broker = server.broker();
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });
    TestBroker {
        addr,
        broker,
        handle: Some(handle),
        _dir: dir,
    }
}

/// Poll `condition` until it holds or the timeout elapses.
#[allow(dead_code)]
pub async fn assert_eventually<F>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}: {message}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
