//! Worker runtime: the client-side agent that registers functions, grabs
//! jobs, executes them with bounded concurrency, and reconnects after
//! transport failures.
//!
//! # Flow
//!
//! 1. [`Worker::add_server`] / [`Worker::add_func`] build the function table
//! 2. [`Worker::work`] connects every agent, registers the table once, and
//!    enters the grab loop
//! 3. NO_JOB answers are followed by PRE_SLEEP; a NOOP wake triggers the
//!    next GRAB_JOB
//! 4. Assignments run as spawned tasks so panics are isolated and reported
//!    as WORK_EXCEPTION

pub(crate) mod agent;
mod job;

pub use job::WorkerJob;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{GearError, Result};
use crate::protocol::{self, Packet, PacketType};

use agent::Agent;

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// How a job function failed.
#[derive(Debug, Error)]
pub enum WorkError {
    /// Sends WORK_FAIL; no data reaches the client.
    #[error("job failed")]
    Fail,

    /// Sends WORK_EXCEPTION carrying the payload.
    #[error("job exception: {}", String::from_utf8_lossy(.0))]
    Exception(Vec<u8>),
}

pub type JobResult = std::result::Result<Vec<u8>, WorkError>;
pub type JobFunc = Arc<dyn Fn(WorkerJob) -> BoxFuture<'static, JobResult> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(GearError) + Send + Sync>;

/// Cap on parallel job executions per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Unlimited,
    OneByOne,
    Limit(usize),
}

#[derive(Clone)]
struct FuncEntry {
    f: JobFunc,
    /// Execution timeout in seconds; 0 disables the timer.
    timeout: u32,
}

#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    funcs: Mutex<HashMap<String, FuncEntry>>,
    agents: Mutex<Vec<Arc<Agent>>>,
    /// Read halves produced by `ready()` and consumed by `work()`.
    pending_reads: Mutex<Vec<(Arc<Agent>, OwnedReadHalf)>>,
    client_id: Mutex<Option<String>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    limit: Option<Arc<Semaphore>>,
    ready_once: OnceCell<()>,
    shutting_down: AtomicBool,
    active: TaskTracker,
    closed: CancellationToken,
}

impl WorkerInner {
    fn err(&self, e: GearError) {
        let handler = lock(&self.error_handler).clone();
        match handler {
            Some(handler) => handler(e),
            None => tracing::error!(error = %e, "Worker error"),
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl Worker {
    pub fn new(concurrency: Concurrency) -> Self {
        let limit = match concurrency {
            Concurrency::Unlimited => None,
            Concurrency::OneByOne => Some(Arc::new(Semaphore::new(1))),
            Concurrency::Limit(n) => Some(Arc::new(Semaphore::new(n.max(1)))),
        };
        Self {
            inner: Arc::new(WorkerInner {
                funcs: Mutex::new(HashMap::new()),
                agents: Mutex::new(Vec::new()),
                pending_reads: Mutex::new(Vec::new()),
                client_id: Mutex::new(None),
                error_handler: Mutex::new(None),
                limit,
                ready_once: OnceCell::new(),
                shutting_down: AtomicBool::new(false),
                active: TaskTracker::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Add a job server address (`host:port`); connections are made by
    /// [`ready`](Self::ready) / [`work`](Self::work).
    pub fn add_server(&self, addr: impl Into<String>) {
        lock(&self.inner.agents).push(Agent::new(addr));
    }

    pub fn set_error_handler(&self, handler: impl Fn(GearError) + Send + Sync + 'static) {
        *lock(&self.inner.error_handler) = Some(Arc::new(handler));
    }

    /// Register a function with an execution timeout in seconds (0 = none).
    /// Already-connected servers learn about it immediately.
    pub async fn add_func<F, Fut>(&self, name: &str, timeout: u32, f: F) -> Result<()>
    where
        F: Fn(WorkerJob) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = JobResult> + Send + 'static,
    {
        let func: JobFunc = Arc::new(move |job| Box::pin(f(job)));
        {
            let mut funcs = lock(&self.inner.funcs);
            if funcs.contains_key(name) {
                return Err(GearError::FuncExists(name.to_string()));
            }
            funcs.insert(name.to_string(), FuncEntry { f: func, timeout });
        }
        if self.inner.ready_once.initialized() {
            self.broadcast(&can_do_packet(name, timeout)).await;
        }
        Ok(())
    }

    /// Unregister a function, telling every server CANT_DO.
    pub async fn remove_func(&self, name: &str) -> Result<()> {
        if lock(&self.inner.funcs).remove(name).is_none() {
            return Err(GearError::FuncMissing(name.to_string()));
        }
        if self.inner.ready_once.initialized() {
            self.broadcast(&Packet::request(
                PacketType::CantDo,
                name.as_bytes().to_vec(),
            ))
            .await;
        }
        Ok(())
    }

    /// Drop every function, both locally and on the servers.
    pub async fn reset(&self) {
        lock(&self.inner.funcs).clear();
        self.broadcast(&Packet::request(PacketType::ResetAbilities, Vec::new()))
            .await;
    }

    /// Set the worker id reported to servers and shown by admin `workers`.
    pub async fn set_id(&self, id: impl Into<String>) {
        let id = id.into();
        *lock(&self.inner.client_id) = Some(id.clone());
        if self.inner.ready_once.initialized() {
            self.broadcast(&Packet::request(PacketType::SetClientId, id.into_bytes()))
                .await;
        }
    }

    pub async fn echo(&self, data: Vec<u8>) {
        self.broadcast(&Packet::request(PacketType::EchoReq, data))
            .await;
    }

    /// Connect every agent and run the initial registration exactly once.
    pub async fn ready(&self) -> Result<()> {
        let inner = self.inner.clone();
        self.inner
            .ready_once
            .get_or_try_init(|| async move {
                let agents: Vec<Arc<Agent>> = lock(&inner.agents).clone();
                if agents.is_empty() {
                    return Err(GearError::NoAgents);
                }
                if lock(&inner.funcs).is_empty() {
                    return Err(GearError::NoFuncs);
                }
                for agent in agents {
                    let read = agent.connect().await?;
                    register_agent(&inner, &agent).await?;
                    lock(&inner.pending_reads).push((agent, read));
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Main loop: start the grab loop on every agent and block until
    /// [`shutdown`](Self::shutdown) or [`close`](Self::close).
    pub async fn work(&self) -> Result<()> {
        self.ready().await?;
        let pending = std::mem::take(&mut *lock(&self.inner.pending_reads));
        for (agent, read) in pending {
            agent
                .write_packet(&Packet::request(PacketType::GrabJob, Vec::new()))
                .await?;
            let inner = self.inner.clone();
            tokio::spawn(agent_loop(inner, agent, read));
        }
        self.inner.closed.cancelled().await;
        Ok(())
    }

    /// Stop grabbing, wait for active jobs, then close connections.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.active.close();
        self.inner.active.wait().await;
        self.close().await;
    }

    /// Close connections and end [`work`](Self::work) without waiting.
    pub async fn close(&self) {
        let agents: Vec<Arc<Agent>> = lock(&self.inner.agents).clone();
        for agent in agents {
            agent.disconnect().await;
        }
        self.inner.closed.cancel();
    }

    async fn broadcast(&self, packet: &Packet) {
        let agents: Vec<Arc<Agent>> = lock(&self.inner.agents).clone();
        for agent in agents {
            if let Err(e) = agent.write_packet(packet).await {
                self.inner.err(e);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn can_do_packet(name: &str, timeout: u32) -> Packet {
    if timeout == 0 {
        Packet::request(PacketType::CanDo, name.as_bytes().to_vec())
    } else {
        // Function name, NUL, 4-byte big-endian timeout.
        let mut data = Vec::with_capacity(name.len() + 5);
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data.extend_from_slice(&timeout.to_be_bytes());
        Packet::request(PacketType::CanDoTimeout, data)
    }
}

/// Send the full function table and client id to one server, done on every
/// (re)connect.
async fn register_agent(inner: &Arc<WorkerInner>, agent: &Arc<Agent>) -> Result<()> {
    let funcs: Vec<(String, u32)> = lock(&inner.funcs)
        .iter()
        .map(|(name, entry)| (name.clone(), entry.timeout))
        .collect();
    for (name, timeout) in funcs {
        agent.write_packet(&can_do_packet(&name, timeout)).await?;
    }
    let client_id = lock(&inner.client_id).clone();
    if let Some(id) = client_id {
        agent
            .write_packet(&Packet::request(PacketType::SetClientId, id.into_bytes()))
            .await?;
    }
    Ok(())
}

/// Per-agent loop: read until the connection drops, then reconnect with
/// exponential backoff and re-register.
async fn agent_loop(inner: Arc<WorkerInner>, agent: Arc<Agent>, mut read: OwnedReadHalf) {
    loop {
        read_session(&inner, &agent, &mut read).await;
        agent.disconnect().await;
        if inner.is_shutting_down() || inner.closed.is_cancelled() {
            break;
        }
        tracing::warn!(addr = %agent.addr(), "Connection lost, reconnecting");
        match reconnect(&inner, &agent).await {
            Some(new_read) => read = new_read,
            None => {
                inner.err(GearError::Disconnected {
                    addr: agent.addr().to_string(),
                });
                break;
            }
        }
    }
}

async fn reconnect(inner: &Arc<WorkerInner>, agent: &Arc<Agent>) -> Option<OwnedReadHalf> {
    let mut delay = RECONNECT_BASE_DELAY;
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        tokio::select! {
            _ = inner.closed.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match agent.connect().await {
            Ok(read) => {
                tracing::info!(addr = %agent.addr(), attempt, "Reconnected to job server");
                if register_agent(inner, agent).await.is_ok()
                    && agent
                        .write_packet(&Packet::request(PacketType::GrabJob, Vec::new()))
                        .await
                        .is_ok()
                {
                    return Some(read);
                }
            }
            Err(e) => {
                tracing::warn!(addr = %agent.addr(), attempt, error = %e, "Reconnect attempt failed");
            }
        }
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
    None
}

async fn read_session(inner: &Arc<WorkerInner>, agent: &Arc<Agent>, read: &mut OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    // Pre-reserved capacity for the next assignment; holding it here keeps
    // the worker from grabbing jobs it has no slot to run.
    let mut reserved: Option<OwnedSemaphorePermit> = None;
    loop {
        let n = tokio::select! {
            _ = inner.closed.cancelled() => return,
            n = read.read_buf(&mut buf) => n,
        };
        match n {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(addr = %agent.addr(), error = %e, "Read failed");
                return;
            }
        }
        loop {
            match protocol::decode(&mut buf) {
                Ok(Some(packet)) => handle_packet(inner, agent, packet, &mut reserved).await,
                Ok(None) => break,
                Err(e) => {
                    inner.err(e.into());
                    return;
                }
            }
        }
    }
}

async fn handle_packet(
    inner: &Arc<WorkerInner>,
    agent: &Arc<Agent>,
    packet: Packet,
    reserved: &mut Option<OwnedSemaphorePermit>,
) {
    match packet.ptype {
        PacketType::NoJob => {
            let _ = agent
                .write_packet(&Packet::request(PacketType::PreSleep, Vec::new()))
                .await;
        }
        PacketType::Noop => {
            if !inner.is_shutting_down() {
                let _ = agent
                    .write_packet(&Packet::request(PacketType::GrabJob, Vec::new()))
                    .await;
            }
        }
        PacketType::JobAssign | PacketType::JobAssignUniq => {
            handle_assignment(inner, agent, packet, reserved).await;
        }
        PacketType::EchoRes => {
            tracing::debug!(len = packet.data.len(), "Echo response");
        }
        PacketType::Error => {
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

async fn handle_assignment(
    inner: &Arc<WorkerInner>,
    agent: &Arc<Agent>,
    packet: Packet,
    reserved: &mut Option<OwnedSemaphorePermit>,
) {
    let parsed = if packet.ptype == PacketType::JobAssignUniq {
        packet.fields(4).map(|f| {
            (
                String::from_utf8_lossy(f[0]).into_owned(),
                String::from_utf8_lossy(f[1]).into_owned(),
                String::from_utf8_lossy(f[2]).into_owned(),
                f[3].to_vec(),
            )
        })
    } else {
        packet.fields(3).map(|f| {
            (
                String::from_utf8_lossy(f[0]).into_owned(),
                String::from_utf8_lossy(f[1]).into_owned(),
                String::new(),
                f[2].to_vec(),
            )
        })
    };
    let (handle, function, unique_id, data) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            inner.err(e.into());
            return;
        }
    };

    let entry = lock(&inner.funcs).get(&function).cloned();
    let Some(entry) = entry else {
        inner.err(GearError::FuncMissing(function.clone()));
        let _ = agent
            .write_packet(&Packet::request(
                PacketType::WorkFail,
                handle.into_bytes(),
            ))
            .await;
        return;
    };

    // Run this job on the reserved slot, or take one now on first use.
    let permit = match reserved.take() {
        Some(permit) => Some(permit),
        None => match &inner.limit {
            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        },
    };

    let job = WorkerJob::new(handle, function, unique_id, data, agent.clone());
    spawn_exec(inner, agent.clone(), entry, job, permit);

    // Reserve capacity for the next assignment before grabbing again, so
    // jobs stay queued on the server while this worker is saturated.
    if let Some(semaphore) = &inner.limit {
        let next = tokio::select! {
            _ = inner.closed.cancelled() => return,
            next = semaphore.clone().acquire_owned() => next,
        };
        match next {
            Ok(permit) => *reserved = Some(permit),
            Err(_) => return,
        }
    }

    if !inner.is_shutting_down() {
        let _ = agent
            .write_packet(&Packet::request(PacketType::GrabJob, Vec::new()))
            .await;
    }
}

/// Run one job function in its own task so panics are contained, racing the
/// per-function timer when one is set.
fn spawn_exec(
    inner: &Arc<WorkerInner>,
    agent: Arc<Agent>,
    entry: FuncEntry,
    job: WorkerJob,
    permit: Option<OwnedSemaphorePermit>,
) {
    let inner = inner.clone();
    inner.active.clone().spawn(async move {
        let _permit = permit;
        if inner.is_shutting_down() {
            return;
        }
        let handle = job.handle().to_string();
        let join = tokio::spawn((entry.f)(job));

        let outcome = if entry.timeout > 0 {
            match tokio::time::timeout(Duration::from_secs(entry.timeout as u64), join).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Timer won; the function keeps running detached and its
                    // eventual result is discarded.
                    inner.err(GearError::TimedOut);
                    let fail =
                        Packet::request(PacketType::WorkFail, handle.clone().into_bytes());
                    if let Err(e) = agent.write_packet(&fail).await {
                        inner.err(e);
                    }
                    return;
                }
            }
        } else {
            join.await
        };

        let response = match outcome {
            Ok(Ok(data)) => Packet::request(
                PacketType::WorkComplete,
                Packet::join(&[handle.as_bytes(), &data]),
            ),
            Ok(Err(WorkError::Fail)) => {
                Packet::request(PacketType::WorkFail, handle.clone().into_bytes())
            }
            Ok(Err(WorkError::Exception(data))) => Packet::request(
                PacketType::WorkException,
                Packet::join(&[handle.as_bytes(), &data]),
            ),
            Err(join_err) => {
                if !join_err.is_panic() {
                    return;
                }
                let message = panic_message(join_err.into_panic());
                tracing::error!(handle = %handle, message = %message, "Job function panicked");
                Packet::request(
                    PacketType::WorkException,
                    Packet::join(&[handle.as_bytes(), message.as_bytes()]),
                )
            }
        };

        if let Err(e) = agent.write_packet(&response).await {
            tracing::error!(handle = %handle, error = %e, "Discarding job result after disconnect");
            inner.err(e);
        }
    });
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown error".to_string()
    }
}
