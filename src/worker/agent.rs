//! One connection from a worker to a job server.
//!
//! The write half lives behind a mutex so job tasks can emit WORK_* packets
//! concurrently; the read half is owned by the worker's read loop. A failed
//! write drops the connection and surfaces as `Disconnected` so the read
//! loop can reconnect.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{GearError, Result};
use crate::protocol::{self, Packet};

pub struct Agent {
    addr: String,
    write: Mutex<Option<OwnedWriteHalf>>,
}

impl Agent {
    pub fn new(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            write: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Dial the server, keep the write half, hand the read half back.
    pub async fn connect(&self) -> Result<OwnedReadHalf> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read, write) = stream.into_split();
        *self.write.lock().await = Some(write);
        Ok(read)
    }

    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        let mut guard = self.write.lock().await;
        let Some(write) = guard.as_mut() else {
            return Err(GearError::Disconnected {
                addr: self.addr.clone(),
            });
        };
        if let Err(e) = write.write_all(&protocol::encode(packet)).await {
            tracing::debug!(addr = %self.addr, error = %e, "Agent write failed");
            *guard = None;
            return Err(GearError::Disconnected {
                addr: self.addr.clone(),
            });
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(mut write) = self.write.lock().await.take() {
            let _ = write.shutdown().await;
        }
    }
}
