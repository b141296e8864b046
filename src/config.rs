use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen address for the binary protocol and text admin verbs.
    pub listen_addr: String,
    /// Directory holding the embedded key/value store files.
    pub storage_dir: PathBuf,
    /// HTTP exposition address; `None` disables the web listener.
    pub web_addr: Option<String>,
    /// Per-session bound on queued outbound packets before the session is
    /// considered slow and closed.
    pub outbound_queue_len: usize,
    /// How long graceful shutdown waits for Running jobs to drain.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4730".to_string(),
            storage_dir: std::env::temp_dir().join("geard"),
            web_addr: Some("0.0.0.0:3000".to_string()),
            outbound_queue_len: 256,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            storage_dir: storage_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_web_addr(mut self, addr: Option<String>) -> Self {
        self.web_addr = addr;
        self
    }
}
