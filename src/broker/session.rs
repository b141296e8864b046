//! One connection: identity, role flags, can-do set, and the reader/writer
//! task pair that drives it.
//!
//! The reader decodes packets and dispatches them on the broker; the writer
//! drains the bounded outbound queue. Per-session mutable state lives in
//! [`SessionEntry`] under the broker-wide lock; other components never touch
//! a session except by posting to its outbound queue.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, Packet, PacketType};

use super::admin::{self, AdminAction};
use super::Broker;

/// Message posted to a session's writer task.
#[derive(Debug)]
pub enum Outbound {
    Packet(Packet),
    /// Raw bytes for text admin responses.
    Raw(Vec<u8>),
}

/// A packet queued for delivery once the broker lock is released.
pub struct Delivery {
    pub sender: mpsc::Sender<Outbound>,
    pub cancel: CancellationToken,
    pub msg: Outbound,
}

/// Per-session state held under the broker lock.
#[derive(Debug)]
pub struct SessionEntry {
    pub id: u64,
    pub addr: SocketAddr,
    pub sender: mpsc::Sender<Outbound>,
    pub cancel: CancellationToken,
    pub is_client: bool,
    pub is_worker: bool,
    /// Worker-supplied label from SET_CLIENT_ID.
    pub client_id: Option<String>,
    /// Function name -> execution timeout in seconds (0 = none).
    pub can_do: HashMap<String, u32>,
    pub sleeping: bool,
    /// Client asked for WORK_EXCEPTION forwarding via OPTION_REQ.
    pub forward_exceptions: bool,
    /// Foreground handles awaiting responses on this session.
    pub outstanding: HashSet<String>,
    pub last_activity: Instant,
}

impl SessionEntry {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        sender: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            sender,
            cancel,
            is_client: false,
            is_worker: false,
            client_id: None,
            can_do: HashMap::new(),
            sleeping: false,
            forward_exceptions: false,
            outstanding: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn post(&self, msg: Outbound) -> Delivery {
        Delivery {
            sender: self.sender.clone(),
            cancel: self.cancel.clone(),
            msg,
        }
    }
}

enum Framing {
    Undetected,
    Binary,
    Admin,
}

/// Drive one accepted connection until it closes or the session is
/// cancelled. Registers the session on entry and removes it on exit.
pub async fn run_session(broker: Arc<Broker>, stream: TcpStream, addr: SocketAddr, id: u64) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Outbound>(broker.config().outbound_queue_len);
    let cancel = CancellationToken::new();

    broker.register_session(id, addr, tx.clone(), cancel.clone());
    tracing::debug!(session = id, addr = %addr, "Session opened");

    let writer = tokio::spawn(run_writer(write_half, rx, cancel.clone()));

    read_loop(&broker, read_half, &tx, &cancel, id).await;

    broker.remove_session(id);
    cancel.cancel();
    let _ = writer.await;
    tracing::debug!(session = id, "Session closed");
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        // Biased so queued packets (e.g. a final ERROR) drain before the
        // cancellation is observed.
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        let bytes = match msg {
            Outbound::Packet(packet) => protocol::encode(&packet),
            Outbound::Raw(bytes) => bytes,
        };
        // A peer that stops reading must not pin this task past cancel.
        tokio::select! {
            result = write_half.write_all(&bytes) => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Session write failed");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    broker: &Arc<Broker>,
    mut read_half: OwnedReadHalf,
    tx: &mpsc::Sender<Outbound>,
    cancel: &CancellationToken,
    id: u64,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut framing = Framing::Undetected;

    'conn: loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break 'conn,
            read = read_half.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => break 'conn,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session = id, error = %e, "Session read failed");
                break 'conn;
            }
        }

        if matches!(framing, Framing::Undetected) && !buf.is_empty() {
            // Binary packets always start with the NUL of \0REQ; anything
            // else is the text admin protocol on the same port.
            framing = if buf[0] == 0 {
                Framing::Binary
            } else {
                Framing::Admin
            };
        }

        match framing {
            Framing::Undetected => {}
            Framing::Binary => loop {
                match protocol::decode(&mut buf) {
                    Ok(Some(packet)) => {
                        if let Err(e) = broker.dispatch(id, packet).await {
                            tracing::warn!(session = id, error = %e, "Dispatch failed, closing session");
                            let _ = tx
                                .send(Outbound::Packet(error_packet("protocol_error", &e.to_string())))
                                .await;
                            break 'conn;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(session = id, error = %e, "Malformed packet, closing session");
                        let _ = tx
                            .send(Outbound::Packet(error_packet("protocol_error", &e.to_string())))
                            .await;
                        break 'conn;
                    }
                }
            },
            Framing::Admin => {
                while let Some(line) = take_line(&mut buf) {
                    let (response, action) = admin::handle_command(broker, &line);
                    if tx.send(Outbound::Raw(response.into_bytes())).await.is_err() {
                        break 'conn;
                    }
                    if action == AdminAction::Shutdown {
                        tracing::info!(session = id, "Shutdown requested over admin socket");
                        broker.begin_shutdown();
                    }
                }
            }
        }
    }
}

/// ERROR packet payload is `code\0human-readable-message`.
pub fn error_packet(code: &str, message: &str) -> Packet {
    Packet::response(
        PacketType::Error,
        Packet::join(&[code.as_bytes(), message.as_bytes()]),
    )
}

fn take_line(buf: &mut BytesMut) -> Option<String> {
    let pos = buf.iter().position(|b| *b == b'\n')?;
    let line = buf.split_to(pos + 1);
    Some(String::from_utf8_lossy(&line[..pos]).trim_end_matches('\r').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_line_splits_on_newline() {
        let mut buf = BytesMut::from(&b"status\nver"[..]);
        assert_eq!(take_line(&mut buf).as_deref(), Some("status"));
        assert_eq!(take_line(&mut buf), None);
        assert_eq!(&buf[..], b"ver");
    }

    #[test]
    fn take_line_strips_carriage_return() {
        let mut buf = BytesMut::from(&b"workers\r\n"[..]);
        assert_eq!(take_line(&mut buf).as_deref(), Some("workers"));
    }
}
