//! Client runtime: submit jobs, demultiplex responses, query status.
//!
//! Each submission blocks only until JOB_CREATED (bounded by the response
//! timeout); WORK_* frames invoke the registered handler asynchronously.
//! JOB_CREATED responses arrive in submission order on one connection, so
//! waiters form a FIFO that the reader task drains.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::broker::job::Priority;
use crate::error::{GearError, Result};
use crate::protocol::{self, Packet, PacketType};

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// A WORK_* frame delivered to a submission's handler.
#[derive(Debug, Clone)]
pub enum WorkEvent {
    Data(Vec<u8>),
    Warning(Vec<u8>),
    Status { numerator: u64, denominator: u64 },
    Complete(Vec<u8>),
    Fail,
    Exception(Vec<u8>),
}

impl WorkEvent {
    /// Terminal events end the handler registration.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkEvent::Complete(_) | WorkEvent::Fail | WorkEvent::Exception(_)
        )
    }
}

pub type ResponseHandler = Arc<dyn Fn(WorkEvent) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(GearError) + Send + Sync>;

/// Answer to a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub known: bool,
    pub running: bool,
    pub numerator: u64,
    pub denominator: u64,
}

type CreatedWaiter = (oneshot::Sender<String>, Option<ResponseHandler>);

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    addr: String,
    write: AsyncMutex<OwnedWriteHalf>,
    /// FIFO of submissions awaiting JOB_CREATED.
    created: Mutex<VecDeque<CreatedWaiter>>,
    handlers: Mutex<HashMap<String, ResponseHandler>>,
    status_waiters: Mutex<VecDeque<oneshot::Sender<JobStatus>>>,
    echo_waiters: Mutex<VecDeque<oneshot::Sender<Vec<u8>>>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    response_timeout: Mutex<Duration>,
}

impl ClientInner {
    fn err(&self, e: GearError) {
        let handler = lock(&self.error_handler).clone();
        match handler {
            Some(handler) => handler(e),
            None => tracing::error!(error = %e, "Client error"),
        }
    }
}

impl Client {
    /// Connect and start the response reader. Exception forwarding is
    /// requested up front so WORK_EXCEPTION frames reach the handlers.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        let inner = Arc::new(ClientInner {
            addr: addr.to_string(),
            write: AsyncMutex::new(write),
            created: Mutex::new(VecDeque::new()),
            handlers: Mutex::new(HashMap::new()),
            status_waiters: Mutex::new(VecDeque::new()),
            echo_waiters: Mutex::new(VecDeque::new()),
            error_handler: Mutex::new(None),
            response_timeout: Mutex::new(DEFAULT_RESPONSE_TIMEOUT),
        });
        tokio::spawn(read_loop(inner.clone(), read));

        let client = Self { inner };
        client
            .write_packet(&Packet::request(
                PacketType::OptionReq,
                b"exceptions".to_vec(),
            ))
            .await?;
        Ok(client)
    }

    pub fn set_response_timeout(&self, timeout: Duration) {
        *lock(&self.inner.response_timeout) = timeout;
    }

    pub fn set_error_handler(&self, handler: impl Fn(GearError) + Send + Sync + 'static) {
        *lock(&self.inner.error_handler) = Some(Arc::new(handler));
    }

    /// Submit a foreground job; the handler fires on every WORK_* frame.
    /// Returns once JOB_CREATED arrives with the job's handle.
    pub async fn submit(
        &self,
        function: &str,
        payload: &[u8],
        priority: Priority,
        handler: impl Fn(WorkEvent) + Send + Sync + 'static,
    ) -> Result<String> {
        let ptype = match priority {
            Priority::Low => PacketType::SubmitJobLow,
            Priority::Normal => PacketType::SubmitJob,
            Priority::High => PacketType::SubmitJobHigh,
        };
        self.submit_inner(ptype, &[function.as_bytes(), b"", payload], Some(Arc::new(handler)))
            .await
    }

    /// Foreground submit with a caller-chosen unique id for coalescing.
    pub async fn submit_unique(
        &self,
        function: &str,
        unique_id: &str,
        payload: &[u8],
        priority: Priority,
        handler: impl Fn(WorkEvent) + Send + Sync + 'static,
    ) -> Result<String> {
        let ptype = match priority {
            Priority::Low => PacketType::SubmitJobLow,
            Priority::Normal => PacketType::SubmitJob,
            Priority::High => PacketType::SubmitJobHigh,
        };
        self.submit_inner(
            ptype,
            &[function.as_bytes(), unique_id.as_bytes(), payload],
            Some(Arc::new(handler)),
        )
        .await
    }

    /// Fire-and-forget background job; persisted by the server.
    pub async fn submit_background(
        &self,
        function: &str,
        payload: &[u8],
        priority: Priority,
    ) -> Result<String> {
        let ptype = match priority {
            Priority::Low => PacketType::SubmitJobLowBg,
            Priority::Normal => PacketType::SubmitJobBg,
            Priority::High => PacketType::SubmitJobHighBg,
        };
        self.submit_inner(ptype, &[function.as_bytes(), b"", payload], None)
            .await
    }

    /// Background job activated at a unix timestamp.
    pub async fn submit_at(&self, function: &str, payload: &[u8], epoch: i64) -> Result<String> {
        self.submit_inner(
            PacketType::SubmitJobEpoch,
            &[
                function.as_bytes(),
                b"",
                epoch.to_string().as_bytes(),
                payload,
            ],
            None,
        )
        .await
    }

    /// Recurring background job from a five-field cron expression
    /// (minute hour day-of-month month day-of-week).
    pub async fn submit_cron(&self, function: &str, payload: &[u8], schedule: &str) -> Result<String> {
        let fields: Vec<&str> = schedule.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(GearError::InvalidCron(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }
        self.submit_inner(
            PacketType::SubmitJobSched,
            &[
                function.as_bytes(),
                b"",
                fields[0].as_bytes(),
                fields[1].as_bytes(),
                fields[2].as_bytes(),
                fields[3].as_bytes(),
                fields[4].as_bytes(),
                payload,
            ],
            None,
        )
        .await
    }

    /// Ask the server about a handle.
    pub async fn status(&self, handle: &str) -> Result<JobStatus> {
        let packet = Packet::request(PacketType::GetStatus, handle.as_bytes().to_vec());
        let (tx, rx) = oneshot::channel();
        // Waiter enqueue and packet write stay atomic under the write lock
        // so responses pair with waiters in order.
        {
            let mut write = self.inner.write.lock().await;
            lock(&self.inner.status_waiters).push_back(tx);
            if let Err(e) = write.write_all(&protocol::encode(&packet)).await {
                lock(&self.inner.status_waiters).pop_back();
                return Err(e.into());
            }
        }
        self.await_response(rx).await
    }

    pub async fn echo(&self, data: &[u8]) -> Result<Vec<u8>> {
        let packet = Packet::request(PacketType::EchoReq, data.to_vec());
        let (tx, rx) = oneshot::channel();
        {
            let mut write = self.inner.write.lock().await;
            lock(&self.inner.echo_waiters).push_back(tx);
            if let Err(e) = write.write_all(&protocol::encode(&packet)).await {
                lock(&self.inner.echo_waiters).pop_back();
                return Err(e.into());
            }
        }
        self.await_response(rx).await
    }

    async fn submit_inner(
        &self,
        ptype: PacketType,
        fields: &[&[u8]],
        handler: Option<ResponseHandler>,
    ) -> Result<String> {
        let packet = Packet::request(ptype, Packet::join(fields));
        let (tx, rx) = oneshot::channel();
        {
            let mut write = self.inner.write.lock().await;
            lock(&self.inner.created).push_back((tx, handler));
            if let Err(e) = write.write_all(&protocol::encode(&packet)).await {
                lock(&self.inner.created).pop_back();
                return Err(e.into());
            }
        }
        self.await_response(rx).await
    }

    async fn await_response<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        let timeout = *lock(&self.inner.response_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(GearError::Disconnected {
                addr: self.inner.addr.clone(),
            }),
            Err(_) => Err(GearError::ResponseTimeout),
        }
    }

    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        let mut write = self.inner.write.lock().await;
        write.write_all(&protocol::encode(packet)).await?;
        Ok(())
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut read: OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        match read.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                inner.err(e.into());
                break;
            }
        }
        loop {
            match protocol::decode(&mut buf) {
                Ok(Some(packet)) => handle_response(&inner, packet),
                Ok(None) => break,
                Err(e) => {
                    inner.err(e.into());
                    return;
                }
            }
        }
    }
    // Dropping the waiters wakes every pending call with a disconnect.
    lock(&inner.created).clear();
    lock(&inner.status_waiters).clear();
    lock(&inner.echo_waiters).clear();
    tracing::debug!(addr = %inner.addr, "Client connection closed");
}

fn handle_response(inner: &Arc<ClientInner>, packet: Packet) {
    use PacketType::*;
    match packet.ptype {
        JobCreated => {
            let handle = String::from_utf8_lossy(&packet.data).into_owned();
            if let Some((tx, handler)) = lock(&inner.created).pop_front() {
                // Register the handler before resolving the waiter so a
                // fast WORK_COMPLETE cannot race past it.
                if let Some(handler) = handler {
                    lock(&inner.handlers).insert(handle.clone(), handler);
                }
                let _ = tx.send(handle);
            } else {
                tracing::warn!(handle = %handle, "JOB_CREATED with no pending submission");
            }
        }
        WorkData | WorkWarning | WorkStatus | WorkComplete | WorkFail | WorkException => {
            let parsed = parse_work_event(&packet);
            let Some((handle, event)) = parsed else {
                inner.err(GearError::Protocol(
                    crate::protocol::CodecError::InvalidText(packet.ptype),
                ));
                return;
            };
            let handler = {
                let mut handlers = lock(&inner.handlers);
                if event.is_terminal() {
                    handlers.remove(&handle)
                } else {
                    handlers.get(&handle).cloned()
                }
            };
            if let Some(handler) = handler {
                handler(event);
            }
        }
        StatusRes => {
            if let Ok(f) = packet.fields(5) {
                let status = JobStatus {
                    known: f[1] == b"1",
                    running: f[2] == b"1",
                    numerator: ascii_u64(f[3]),
                    denominator: ascii_u64(f[4]),
                };
                if let Some(tx) = lock(&inner.status_waiters).pop_front() {
                    let _ = tx.send(status);
                }
            }
        }
        EchoRes => {
            if let Some(tx) = lock(&inner.echo_waiters).pop_front() {
                let _ = tx.send(packet.data);
            }
        }
        OptionRes => {}
        Error => {
            let (code, message) = match packet.fields(2) {
                Ok(f) => (
                    String::from_utf8_lossy(f[0]).into_owned(),
                    String::from_utf8_lossy(f[1]).into_owned(),
                ),
                Err(_) => (
                    "malformed".to_string(),
                    String::from_utf8_lossy(&packet.data).into_owned(),
                ),
            };
            inner.err(GearError::Server { code, message });
        }
        other => {
            tracing::debug!(ptype = ?other, "Ignoring packet");
        }
    }
}

fn parse_work_event(packet: &Packet) -> Option<(String, WorkEvent)> {
    use PacketType::*;
    match packet.ptype {
        WorkFail => Some((
            String::from_utf8_lossy(&packet.data).into_owned(),
            WorkEvent::Fail,
        )),
        WorkStatus => {
            let f = packet.fields(3).ok()?;
            Some((
                String::from_utf8_lossy(f[0]).into_owned(),
                WorkEvent::Status {
                    numerator: ascii_u64(f[1]),
                    denominator: ascii_u64(f[2]),
                },
            ))
        }
        _ => {
            let f = packet.fields(2).ok()?;
            let handle = String::from_utf8_lossy(f[0]).into_owned();
            let data = f[1].to_vec();
            let event = match packet.ptype {
                WorkData => WorkEvent::Data(data),
                WorkWarning => WorkEvent::Warning(data),
                WorkComplete => WorkEvent::Complete(data),
                WorkException => WorkEvent::Exception(data),
                _ => return None,
            };
            Some((handle, event))
        }
    }
}

fn ascii_u64(bytes: &[u8]) -> u64 {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
