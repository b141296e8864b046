//! The broker: queue core, job registry, session table, persistence glue,
//! and the dispatcher that connects them.
//!
//! A single [`Broker`] value owns all shared state behind one coarse mutex.
//! The lock is held only across in-memory manipulation; persistence and
//! socket writes always happen with the lock released. Sessions hold
//! non-owning references to the broker and talk to each other only through
//! outbound queues.

pub mod admin;
pub mod job;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{GearError, Result};
use crate::protocol::{CodecError, Packet, PacketType};
use crate::storage::{JobRecord, JobStore};
use crate::web::metrics::Metrics;

use job::{Job, JobState, Priority};
use queue::QueueCore;
use registry::{JobRegistry, JobStatus};
use scheduler::Scheduler;
use session::{Delivery, Outbound, SessionEntry};

/// Everything guarded by the broker-wide lock.
pub struct BrokerState {
    pub queues: QueueCore,
    pub registry: JobRegistry,
    pub sessions: HashMap<u64, SessionEntry>,
}

pub struct Broker {
    state: Mutex<BrokerState>,
    pub store: JobStore,
    pub metrics: Metrics,
    pub scheduler: Scheduler,
    config: ServerConfig,
    hostname: String,
    shutdown: CancellationToken,
}

impl Broker {
    /// Open the store, replay durable jobs, and return a ready broker.
    pub fn new(config: ServerConfig) -> Result<Broker> {
        let store = JobStore::open(&config.storage_dir)?;
        let metrics = Metrics::new()?;
        let scheduler = Scheduler::new();
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let mut state = BrokerState {
            queues: QueueCore::default(),
            registry: JobRegistry::default(),
            sessions: HashMap::new(),
        };

        let now = Utc::now();
        let mut immediate: Vec<(i64, String)> = Vec::new();
        let mut pending: Vec<(String, DateTime<Utc>)> = Vec::new();
        let mut replayed = 0usize;

        store.range(|handle, record| {
            replayed += 1;
            state.registry.reserve_handle(&handle);
            let mut job = Job::new(
                handle.clone(),
                record.function.clone(),
                record.unique_id.clone(),
                record.payload.clone(),
            );
            job.priority = record.priority;
            job.background = true;
            job.durable = true;
            job.cron = record.cron.clone();

            match &record.cron {
                Some(expr) => match scheduler::cron_next(expr, now) {
                    Ok(next) => {
                        job.due_at = Some(next);
                        state.registry.insert(job);
                        pending.push((handle, next));
                    }
                    Err(e) => {
                        tracing::warn!(handle = %handle, error = %e, "Skipping replay of bad cron record");
                    }
                },
                None => {
                    if record.due_at > now.timestamp() {
                        let at = DateTime::<Utc>::from_timestamp(record.due_at, 0)
                            .unwrap_or_else(Utc::now);
                        job.due_at = Some(at);
                        state.registry.insert(job);
                        pending.push((handle, at));
                    } else {
                        state.registry.insert(job);
                        immediate.push((record.due_at, handle));
                    }
                }
            }
        })?;

        // Missed wakes replay right away, earliest due-at first.
        immediate.sort();
        for (_, handle) in immediate {
            if let Some(job) = state.registry.get(&handle) {
                let function = job.function.clone();
                let priority = job.priority;
                state.queues.function_mut(&function).push(priority, handle);
            }
        }

        if replayed > 0 {
            tracing::info!(replayed, "Replayed durable jobs from store");
        }

        let broker = Broker {
            state: Mutex::new(state),
            store,
            metrics,
            scheduler,
            config,
            hostname,
            shutdown: CancellationToken::new(),
        };
        for (handle, at) in pending {
            broker.scheduler.schedule(handle, at);
        }
        Ok(broker)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Post queued deliveries, called only after the state lock is dropped.
    /// A full outbound queue marks the session slow and closes it.
    fn flush(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery.sender.try_send(delivery.msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Outbound queue full, closing slow session");
                    delivery.cancel.cancel();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn post_to(&self, session: u64, msg: Outbound) {
        let delivery = {
            let state = self.lock_state();
            state.sessions.get(&session).map(|entry| entry.post(msg))
        };
        if let Some(delivery) = delivery {
            self.flush(vec![delivery]);
        }
    }

    pub fn register_session(
        &self,
        id: u64,
        addr: SocketAddr,
        sender: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) {
        let mut state = self.lock_state();
        state
            .sessions
            .insert(id, SessionEntry::new(id, addr, sender, cancel));
    }

    /// Tear down a closed session: drop it from the sleeping sets, orphan
    /// its foreground jobs, and requeue anything it was running.
    pub fn remove_session(&self, session: u64) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(entry) = state.sessions.remove(&session) else {
                return;
            };
            let BrokerState {
                queues,
                registry,
                sessions,
            } = &mut *state;
            queues.remove_sleeper_everywhere(session);

            for handle in &entry.outstanding {
                if let Some(job) = registry.get_mut(handle) {
                    job.client_session = None;
                }
            }

            for handle in registry.running_on_session(session) {
                if let Some(job) = registry.get_mut(&handle) {
                    job.state = JobState::Queued;
                    job.worker_session = None;
                    let function = job.function.clone();
                    let priority = job.priority;
                    queues.function_mut(&function).push_front(priority, handle.clone());
                    if let Some(sleeper) = queues.function_mut(&function).take_sleeper() {
                        if let Some(worker) = sessions.get(&sleeper) {
                            deliveries
                                .push(worker.post(Outbound::Packet(Packet::response(PacketType::Noop, Vec::new()))));
                        }
                    }
                    tracing::info!(handle = %handle, session, "Requeued job from dead worker");
                }
            }
        }
        self.flush(deliveries);
    }

    /// Route one decoded packet from a session. Errors are fatal for the
    /// session; the caller answers with an ERROR packet and closes.
    pub async fn dispatch(&self, session: u64, packet: Packet) -> Result<()> {
        use PacketType::*;
        match packet.ptype {
            CanDo | CanDoTimeout => self.handle_can_do(session, &packet),
            CantDo => self.handle_cant_do(session, &packet),
            ResetAbilities => self.handle_reset_abilities(session),
            PreSleep => self.handle_pre_sleep(session),
            GrabJob => self.handle_grab(session, false),
            GrabJobUniq => self.handle_grab(session, true),
            SetClientId => self.handle_set_client_id(session, &packet),
            EchoReq => {
                self.post_to(
                    session,
                    Outbound::Packet(Packet::response(EchoRes, packet.data)),
                );
                Ok(())
            }
            OptionReq => self.handle_option(session, &packet),
            GetStatus => self.handle_get_status(session, &packet),
            WorkStatus | WorkData | WorkWarning | WorkComplete | WorkFail | WorkException => {
                self.handle_work(session, packet).await
            }
            ptype if ptype.is_submit() => self.handle_submit(session, packet).await,
            other => Err(CodecError::Unexpected(other).into()),
        }
    }

    fn handle_can_do(&self, session: u64, packet: &Packet) -> Result<()> {
        let (function, timeout) = if packet.ptype == PacketType::CanDo {
            (text(&packet.data, packet.ptype)?, 0)
        } else {
            // CAN_DO_TIMEOUT is the function name, NUL, then a 4-byte
            // big-endian timeout in seconds.
            let pos = packet
                .data
                .iter()
                .position(|b| *b == 0)
                .ok_or(CodecError::FieldCount {
                    ptype: packet.ptype,
                    expected: 2,
                    got: 1,
                })?;
            let rest = &packet.data[pos + 1..];
            if rest.len() != 4 {
                return Err(CodecError::InvalidText(packet.ptype).into());
            }
            let timeout = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            (text(&packet.data[..pos], packet.ptype)?, timeout)
        };

        let mut state = self.lock_state();
        let entry = entry_mut(&mut state, session)?;
        entry.is_worker = true;
        entry.can_do.insert(function, timeout);
        Ok(())
    }

    fn handle_cant_do(&self, session: u64, packet: &Packet) -> Result<()> {
        let function = text(&packet.data, packet.ptype)?;
        let mut state = self.lock_state();
        let BrokerState {
            queues, sessions, ..
        } = &mut *state;
        let entry = sessions
            .get_mut(&session)
            .ok_or_else(|| unknown_session(session))?;
        entry.can_do.remove(&function);
        queues.function_mut(&function).remove_sleeper(session);
        Ok(())
    }

    fn handle_reset_abilities(&self, session: u64) -> Result<()> {
        let mut state = self.lock_state();
        let BrokerState {
            queues, sessions, ..
        } = &mut *state;
        let entry = sessions
            .get_mut(&session)
            .ok_or_else(|| unknown_session(session))?;
        entry.can_do.clear();
        queues.remove_sleeper_everywhere(session);
        Ok(())
    }

    fn handle_set_client_id(&self, session: u64, packet: &Packet) -> Result<()> {
        let id = text(&packet.data, packet.ptype)?;
        let mut state = self.lock_state();
        let entry = entry_mut(&mut state, session)?;
        entry.is_worker = true;
        entry.client_id = Some(id);
        Ok(())
    }

    fn handle_option(&self, session: u64, packet: &Packet) -> Result<()> {
        let option = text(&packet.data, packet.ptype)?;
        if option == "exceptions" {
            {
                let mut state = self.lock_state();
                let entry = entry_mut(&mut state, session)?;
                entry.is_client = true;
                entry.forward_exceptions = true;
            }
            self.post_to(
                session,
                Outbound::Packet(Packet::response(
                    PacketType::OptionRes,
                    option.into_bytes(),
                )),
            );
        } else {
            self.post_to(
                session,
                Outbound::Packet(session::error_packet("unknown_option", &option)),
            );
        }
        Ok(())
    }

    /// PRE_SLEEP: join the sleeping set of every advertised function. When a
    /// job arrived between the worker's last grab and this packet, wake it
    /// immediately so the job is not stranded until the next enqueue.
    fn handle_pre_sleep(&self, session: u64) -> Result<()> {
        let mut deliveries = Vec::new();
        {
            let mut state = self.lock_state();
            let BrokerState {
                queues, sessions, ..
            } = &mut *state;
            let entry = sessions
                .get_mut(&session)
                .ok_or_else(|| unknown_session(session))?;
            entry.is_worker = true;
            entry.sleeping = true;
            let mut wake = false;
            for function in entry.can_do.keys() {
                let fq = queues.function_mut(function);
                if !fq.is_empty() {
                    wake = true;
                }
                fq.add_sleeper(session);
            }
            if wake {
                deliveries.push(entry.post(Outbound::Packet(Packet::response(
                    PacketType::Noop,
                    Vec::new(),
                ))));
            }
        }
        self.flush(deliveries);
        Ok(())
    }

    /// GRAB_JOB: scan the session's can-do set, priorities HIGH to LOW, and
    /// hand over the first queued job. The lock guarantees racing grabs get
    /// the job exactly once; losers see NO_JOB.
    fn handle_grab(&self, session: u64, uniq: bool) -> Result<()> {
        let mut deliveries = Vec::new();
        {
            let mut state = self.lock_state();
            let BrokerState {
                queues,
                registry,
                sessions,
            } = &mut *state;
            let entry = sessions
                .get_mut(&session)
                .ok_or_else(|| unknown_session(session))?;
            entry.is_worker = true;
            entry.sleeping = false;
            queues.remove_sleeper_everywhere(session);

            let functions: Vec<String> = entry.can_do.keys().cloned().collect();
            let mut assigned: Option<Packet> = None;
            'scan: for function in &functions {
                let fq = queues.function_mut(function);
                while let Some(handle) = fq.pop() {
                    // Handles may outlive their job (cancelled); skip those.
                    if let Some(job) = registry.get_mut(&handle) {
                        job.state = JobState::Running;
                        job.worker_session = Some(session);
                        let packet = if uniq {
                            Packet::response(
                                PacketType::JobAssignUniq,
                                Packet::join(&[
                                    handle.as_bytes(),
                                    function.as_bytes(),
                                    job.unique_id.as_bytes(),
                                    &job.payload,
                                ]),
                            )
                        } else {
                            Packet::response(
                                PacketType::JobAssign,
                                Packet::join(&[handle.as_bytes(), function.as_bytes(), &job.payload]),
                            )
                        };
                        tracing::debug!(handle = %handle, function = %function, session, "Job assigned");
                        assigned = Some(packet);
                        break 'scan;
                    }
                }
            }

            let reply = assigned
                .unwrap_or_else(|| Packet::response(PacketType::NoJob, Vec::new()));
            deliveries.push(entry.post(Outbound::Packet(reply)));
        }
        self.flush(deliveries);
        Ok(())
    }

    fn handle_get_status(&self, session: u64, packet: &Packet) -> Result<()> {
        let handle = text(&packet.data, packet.ptype)?;
        let (status, delivery) = {
            let mut state = self.lock_state();
            if let Some(entry) = state.sessions.get_mut(&session) {
                entry.is_client = true;
            }
            let status = state.registry.status(&handle);
            let payload = Packet::join(&[
                handle.as_bytes(),
                bool_field(status.known),
                bool_field(status.running),
                status.numerator.to_string().as_bytes(),
                status.denominator.to_string().as_bytes(),
            ]);
            let delivery = state.sessions.get(&session).map(|entry| {
                entry.post(Outbound::Packet(Packet::response(
                    PacketType::StatusRes,
                    payload,
                )))
            });
            (status, delivery)
        };
        if !status.known {
            tracing::debug!(handle = %handle, "Status query for unknown handle");
        }
        if let Some(delivery) = delivery {
            self.flush(vec![delivery]);
        }
        Ok(())
    }

    /// All SUBMIT_JOB_* variants: coalesce or create, persist durable jobs
    /// before JOB_CREATED, then enqueue or hand to the scheduler.
    async fn handle_submit(&self, session: u64, packet: Packet) -> Result<()> {
        use PacketType::*;
        let ptype = packet.ptype;

        let (function, unique_raw, payload, epoch, cron) = match ptype {
            SubmitJobEpoch => {
                let f = packet.fields(4)?;
                let epoch = parse_ascii_i64(f[2]).ok_or(CodecError::InvalidText(ptype))?;
                (
                    text(f[0], ptype)?,
                    f[1].to_vec(),
                    f[3].to_vec(),
                    Some(epoch),
                    None,
                )
            }
            SubmitJobSched => {
                let f = packet.fields(8)?;
                let expr = match scheduler::cron_expr_from_fields(&f[2..7]) {
                    Ok(expr) => expr,
                    Err(e) => {
                        self.post_to(
                            session,
                            Outbound::Packet(session::error_packet("invalid_cron", &e.to_string())),
                        );
                        return Ok(());
                    }
                };
                (
                    text(f[0], ptype)?,
                    f[1].to_vec(),
                    f[7].to_vec(),
                    None,
                    Some(expr),
                )
            }
            _ => {
                let f = packet.fields(3)?;
                (text(f[0], ptype)?, f[1].to_vec(), f[2].to_vec(), None, None)
            }
        };

        let unique = if unique_raw.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            String::from_utf8(unique_raw).map_err(|_| CodecError::InvalidText(ptype))?
        };
        let priority = Priority::from_submit(ptype);
        let background = matches!(
            ptype,
            SubmitJobBg | SubmitJobLowBg | SubmitJobHighBg | SubmitJobSched | SubmitJobEpoch
        );

        // Validate cron and compute the first fire before any state changes.
        let cron_first_fire = match &cron {
            Some(expr) => match scheduler::cron_next(expr, Utc::now()) {
                Ok(at) => Some(at),
                Err(e) => {
                    self.post_to(
                        session,
                        Outbound::Packet(session::error_packet("invalid_cron", &e.to_string())),
                    );
                    return Ok(());
                }
            },
            None => None,
        };
        let due_at = match epoch {
            Some(ts) => {
                Some(DateTime::<Utc>::from_timestamp(ts, 0).ok_or(CodecError::InvalidText(ptype))?)
            }
            None => cron_first_fire,
        };
        let scheduled = cron.is_some() || due_at.map(|t| t > Utc::now()).unwrap_or(false);

        // Coalesce, or reserve the unique id by inserting the job.
        let handle;
        let record;
        {
            let mut state = self.lock_state();
            if let Some(entry) = state.sessions.get_mut(&session) {
                entry.is_client = true;
            }
            if let Some(existing) = state.registry.find_coalescible(&function, &unique) {
                let coalesced = existing.handle.clone();
                drop(state);
                tracing::debug!(handle = %coalesced, function = %function, "Coalesced duplicate submission");
                self.post_to(
                    session,
                    Outbound::Packet(Packet::response(JobCreated, coalesced.into_bytes())),
                );
                return Ok(());
            }

            handle = state.registry.allocate_handle(&self.hostname);
            let mut job = Job::new(handle.clone(), function.clone(), unique.clone(), payload);
            job.priority = priority;
            job.background = background;
            job.durable = background;
            job.cron = cron.clone();
            job.due_at = if scheduled { due_at } else { None };
            job.client_session = (!background).then_some(session);
            record = background.then(|| {
                let mut record = JobRecord::from_job(&job);
                record.due_at = epoch.unwrap_or(0);
                record
            });
            state.registry.insert(job);
            if !background {
                if let Some(entry) = state.sessions.get_mut(&session) {
                    entry.outstanding.insert(handle.clone());
                }
            }
        }
        self.metrics.jobs_submitted.inc();

        // Durable jobs hit the disk before the client hears JOB_CREATED.
        if let Some(record) = &record {
            if let Err(e) = self.store.put(&handle, record).await {
                tracing::error!(handle = %handle, error = %e, "Persist failed, rejecting submit");
                {
                    let mut state = self.lock_state();
                    state.registry.remove(&handle);
                }
                self.post_to(
                    session,
                    Outbound::Packet(session::error_packet("persistence", "could not persist job")),
                );
                return Ok(());
            }
        }

        let mut deliveries = Vec::new();
        let mut queue_full = false;
        {
            let mut state = self.lock_state();
            let BrokerState {
                queues,
                registry,
                sessions,
            } = &mut *state;
            // JOB_CREATED is queued before the job becomes grabbable so it
            // always precedes any WORK_* response on this connection.
            if let Some(entry) = sessions.get(&session) {
                deliveries.push(entry.post(Outbound::Packet(Packet::response(
                    JobCreated,
                    handle.clone().into_bytes(),
                ))));
            }
            if !scheduled {
                let fq = queues.function_mut(&function);
                if fq.push(priority, handle.clone()) {
                    if let Some(sleeper) = fq.take_sleeper() {
                        if let Some(worker) = sessions.get(&sleeper) {
                            deliveries.push(worker.post(Outbound::Packet(Packet::response(
                                PacketType::Noop,
                                Vec::new(),
                            ))));
                        }
                    }
                } else {
                    registry.remove(&handle);
                    if let Some(entry) = sessions.get_mut(&session) {
                        entry.outstanding.remove(&handle);
                    }
                    deliveries.clear();
                    if let Some(entry) = sessions.get(&session) {
                        deliveries.push(entry.post(Outbound::Packet(session::error_packet(
                            "queue_full",
                            &function,
                        ))));
                    }
                    queue_full = true;
                }
            }
        }
        self.flush(deliveries);

        if queue_full {
            if record.is_some() {
                self.store.delete(&handle)?;
            }
            tracing::warn!(function = %function, "Submit rejected, queue full");
            return Ok(());
        }
        if scheduled {
            if let Some(at) = due_at {
                self.scheduler.schedule(handle.clone(), at);
            }
        }
        tracing::debug!(
            handle = %handle,
            function = %function,
            priority = %priority,
            background,
            scheduled,
            "Job created"
        );
        Ok(())
    }

    /// WORK_* from a worker: update progress, forward to the originating
    /// client, and on terminal packets clear registry and store.
    async fn handle_work(&self, session: u64, packet: Packet) -> Result<()> {
        use PacketType::*;
        let ptype = packet.ptype;
        let handle = match ptype {
            WorkFail => text(&packet.data, ptype)?,
            WorkStatus => text(packet.fields(3)?[0], ptype)?,
            _ => text(packet.fields(2)?[0], ptype)?,
        };
        let terminal = matches!(ptype, WorkComplete | WorkFail | WorkException);

        let mut deliveries = Vec::new();
        let mut purge = false;
        {
            let mut state = self.lock_state();
            let BrokerState {
                queues,
                registry,
                sessions,
            } = &mut *state;
            if let Some(entry) = sessions.get_mut(&session) {
                entry.is_worker = true;
            }
            let Some(job) = registry.get_mut(&handle) else {
                tracing::debug!(handle = %handle, ptype = ?ptype, "Work packet for unknown handle");
                return Ok(());
            };
            if ptype == WorkStatus {
                let f = packet.fields(3)?;
                job.numerator =
                    parse_ascii_u64(f[1]).ok_or(CodecError::InvalidText(ptype))?;
                job.denominator =
                    parse_ascii_u64(f[2]).ok_or(CodecError::InvalidText(ptype))?;
            }
            let client_session = job.client_session;
            let function = job.function.clone();
            let durable = job.durable;

            if let Some(client) = client_session {
                if let Some(entry) = sessions.get(&client) {
                    // Exceptions reach only clients that opted in; everyone
                    // else sees a plain failure.
                    let forward = if ptype == WorkException && !entry.forward_exceptions {
                        Packet::response(WorkFail, handle.clone().into_bytes())
                    } else {
                        Packet::response(ptype, packet.data.clone())
                    };
                    deliveries.push(entry.post(Outbound::Packet(forward)));
                }
            }

            if terminal {
                registry.remove(&handle);
                queues.function_mut(&function).remove(&handle);
                if let Some(client) = client_session {
                    if let Some(entry) = sessions.get_mut(&client) {
                        entry.outstanding.remove(&handle);
                    }
                }
                purge = durable;
                if ptype == WorkComplete {
                    self.metrics.jobs_completed.inc();
                } else {
                    self.metrics.jobs_failed.inc();
                }
                tracing::debug!(handle = %handle, ptype = ?ptype, "Job finished");
            }
        }
        self.flush(deliveries);
        if purge {
            self.store.delete(&handle)?;
        }
        Ok(())
    }

    /// Promote one scheduled handle. Epoch jobs enter the queue themselves;
    /// cron jobs re-schedule and submit a durable background instance, with
    /// unique-id coalescing suppressing overlapping fires.
    pub async fn fire_scheduled(&self, handle: &str) -> Result<()> {
        let snapshot = {
            let state = self.lock_state();
            state.registry.get(handle).map(|job| {
                (
                    job.function.clone(),
                    job.unique_id.clone(),
                    job.payload.clone(),
                    job.priority,
                    job.cron.clone(),
                )
            })
        };
        let Some((function, unique, payload, priority, cron)) = snapshot else {
            return Ok(());
        };

        match cron {
            Some(expr) => {
                match scheduler::cron_next(&expr, Utc::now()) {
                    Ok(next) => {
                        {
                            let mut state = self.lock_state();
                            if let Some(job) = state.registry.get_mut(handle) {
                                job.due_at = Some(next);
                            }
                        }
                        self.scheduler.schedule(handle.to_string(), next);
                    }
                    Err(e) => {
                        tracing::error!(handle = %handle, error = %e, "Cron re-schedule failed")
                    }
                }

                let instance = {
                    let mut state = self.lock_state();
                    if state.registry.find_coalescible(&function, &unique).is_some() {
                        tracing::debug!(handle = %handle, "Previous cron instance still queued, skipping fire");
                        None
                    } else {
                        let instance = state.registry.allocate_handle(&self.hostname);
                        let mut job =
                            Job::new(instance.clone(), function.clone(), unique.clone(), payload);
                        job.priority = priority;
                        job.background = true;
                        job.durable = true;
                        let record = JobRecord::from_job(&job);
                        state.registry.insert(job);
                        Some((instance, record))
                    }
                };
                if let Some((instance, record)) = instance {
                    self.store.put(&instance, &record).await?;
                    self.metrics.jobs_submitted.inc();
                    self.enqueue_existing(&instance, &function, priority);
                    tracing::debug!(cron = %handle, instance = %instance, "Cron job fired");
                }
            }
            None => {
                {
                    let mut state = self.lock_state();
                    if let Some(job) = state.registry.get_mut(handle) {
                        job.due_at = None;
                    }
                }
                self.enqueue_existing(handle, &function, priority);
                tracing::debug!(handle = %handle, "Scheduled job promoted");
            }
        }
        Ok(())
    }

    /// Enqueue a job already present in the registry and wake one sleeper.
    fn enqueue_existing(&self, handle: &str, function: &str, priority: Priority) {
        let mut deliveries = Vec::new();
        let mut capped = false;
        {
            let mut state = self.lock_state();
            let BrokerState {
                queues, sessions, ..
            } = &mut *state;
            let fq = queues.function_mut(function);
            if fq.push(priority, handle.to_string()) {
                if let Some(sleeper) = fq.take_sleeper() {
                    if let Some(worker) = sessions.get(&sleeper) {
                        deliveries.push(worker.post(Outbound::Packet(Packet::response(
                            PacketType::Noop,
                            Vec::new(),
                        ))));
                    }
                }
            } else {
                capped = true;
            }
        }
        self.flush(deliveries);
        if capped {
            // Queue is at its cap; retry the promotion shortly.
            tracing::warn!(handle = %handle, function = %function, "Queue full, delaying scheduled promotion");
            self.scheduler
                .schedule(handle.to_string(), Utc::now() + chrono::Duration::seconds(60));
        }
    }

    /// Wait for Running jobs to finish, bounded by the grace window.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let running = self.lock_state().registry.running_total();
            if running == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(running, "Grace window elapsed with jobs still running");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn close_sessions(&self) {
        let tokens: Vec<CancellationToken> = {
            let state = self.lock_state();
            state.sessions.values().map(|e| e.cancel.clone()).collect()
        };
        for token in tokens {
            token.cancel();
        }
    }

    // ---- observability ----

    pub fn job_status(&self, handle: &str) -> JobStatus {
        self.lock_state().registry.status(handle)
    }

    pub fn queued_total(&self) -> usize {
        self.lock_state().queues.queued_total()
    }

    pub fn running_total(&self) -> usize {
        self.lock_state().registry.running_total()
    }

    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    pub fn jobs_view(&self) -> Vec<JobView> {
        let state = self.lock_state();
        let mut jobs: Vec<JobView> = state.registry.jobs().map(JobView::from_job).collect();
        jobs.sort_by(|a, b| a.handle.cmp(&b.handle));
        jobs
    }

    pub fn job_view(&self, handle: &str) -> Option<JobView> {
        self.lock_state().registry.get(handle).map(JobView::from_job)
    }

    pub fn workers_view(&self) -> Vec<WorkerView> {
        let state = self.lock_state();
        let mut workers: Vec<WorkerView> = state
            .sessions
            .values()
            .filter(|s| s.is_worker)
            .map(WorkerView::from_entry)
            .collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    pub fn workers_for_function(&self, function: &str) -> Vec<WorkerView> {
        self.workers_view()
            .into_iter()
            .filter(|w| w.functions.iter().any(|f| f == function))
            .collect()
    }

    /// Set gauges from live state; called at metrics scrape time.
    pub fn refresh_gauges(&self) {
        let state = self.lock_state();
        self.metrics
            .queued
            .set(state.queues.queued_total() as i64);
        self.metrics
            .running
            .set(state.registry.running_total() as i64);
        self.metrics.workers.set(
            state.sessions.values().filter(|s| s.is_worker).count() as i64,
        );
        self.metrics.connections.set(state.sessions.len() as i64);
    }

    // ---- admin verbs ----

    /// Per-function `name total running workers` lines, `.` terminated.
    pub fn admin_status(&self) -> String {
        let state = self.lock_state();
        let mut functions: BTreeSet<String> = state
            .queues
            .functions()
            .map(|(name, _)| name.clone())
            .collect();
        for entry in state.sessions.values() {
            functions.extend(entry.can_do.keys().cloned());
        }

        let mut out = String::new();
        for function in functions {
            let queued = state
                .queues
                .function(&function)
                .map(|q| q.queued_len())
                .unwrap_or(0);
            let running = state.registry.running_for_function(&function);
            let workers = state
                .sessions
                .values()
                .filter(|s| s.can_do.contains_key(&function))
                .count();
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                function,
                queued + running,
                running,
                workers
            ));
        }
        out.push_str(".\n");
        out
    }

    /// One line per worker session, `.` terminated.
    pub fn admin_workers(&self) -> String {
        let state = self.lock_state();
        let mut workers: Vec<&SessionEntry> =
            state.sessions.values().filter(|s| s.is_worker).collect();
        workers.sort_by_key(|s| s.id);

        let mut out = String::new();
        for entry in workers {
            let mut functions: Vec<&str> =
                entry.can_do.keys().map(String::as_str).collect();
            functions.sort_unstable();
            out.push_str(&format!(
                "{} {} {} :",
                entry.id,
                entry.addr.ip(),
                entry.client_id.as_deref().unwrap_or("-")
            ));
            for function in functions {
                out.push(' ');
                out.push_str(function);
            }
            out.push('\n');
        }
        out.push_str(".\n");
        out
    }

    pub fn set_max_queue(&self, function: &str, max: Option<usize>) {
        let mut state = self.lock_state();
        state.queues.function_mut(function).set_max_queue(max);
    }
}

/// JSON shape served by the HTTP listener.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub handle: String,
    pub function: String,
    pub unique_id: String,
    pub priority: String,
    pub state: String,
    pub background: bool,
    pub created_at: String,
    pub due_at: Option<String>,
    pub numerator: u64,
    pub denominator: u64,
}

impl JobView {
    fn from_job(job: &Job) -> Self {
        Self {
            handle: job.handle.clone(),
            function: job.function.clone(),
            unique_id: job.unique_id.clone(),
            priority: job.priority.to_string(),
            state: job.state.to_string(),
            background: job.background,
            created_at: job.created_at.to_rfc3339(),
            due_at: job.due_at.map(|t| t.to_rfc3339()),
            numerator: job.numerator,
            denominator: job.denominator,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub id: u64,
    pub addr: String,
    pub client_id: Option<String>,
    pub sleeping: bool,
    pub functions: Vec<String>,
}

impl WorkerView {
    fn from_entry(entry: &SessionEntry) -> Self {
        let mut functions: Vec<String> = entry.can_do.keys().cloned().collect();
        functions.sort_unstable();
        Self {
            id: entry.id,
            addr: entry.addr.to_string(),
            client_id: entry.client_id.clone(),
            sleeping: entry.sleeping,
            functions,
        }
    }
}

fn entry_mut<'a>(
    state: &'a mut MutexGuard<'_, BrokerState>,
    session: u64,
) -> Result<&'a mut SessionEntry> {
    state
        .sessions
        .get_mut(&session)
        .ok_or_else(|| unknown_session(session))
}

fn unknown_session(session: u64) -> GearError {
    GearError::Internal(format!("unknown session {session}"))
}

fn text(bytes: &[u8], ptype: PacketType) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidText(ptype).into())
}

fn bool_field(value: bool) -> &'static [u8] {
    if value {
        b"1"
    } else {
        b"0"
    }
}

fn parse_ascii_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_ascii_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
