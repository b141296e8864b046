use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::PacketType;

/// Job priority. Ordering is strict across levels, FIFO within a level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl Priority {
    /// Priority encoded in the submit packet type.
    pub fn from_submit(ptype: PacketType) -> Self {
        use PacketType::*;
        match ptype {
            SubmitJobLow | SubmitJobLowBg => Priority::Low,
            SubmitJobHigh | SubmitJobHighBg => Priority::High,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Done,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Done => write!(f, "done"),
        }
    }
}

/// A live job owned by the broker's registry.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: String,
    pub function: String,
    pub unique_id: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// When a scheduled job becomes eligible; `None` means immediate.
    pub due_at: Option<DateTime<Utc>>,
    /// Five-field cron expression for recurring jobs.
    pub cron: Option<String>,
    pub background: bool,
    /// Durable jobs have a store record while Queued or Running.
    pub durable: bool,
    /// Originating client session; `None` for background jobs.
    pub client_session: Option<u64>,
    /// Worker session the job is assigned to while Running.
    pub worker_session: Option<u64>,
    pub numerator: u64,
    pub denominator: u64,
    pub state: JobState,
}

impl Job {
    pub fn new(handle: String, function: String, unique_id: String, payload: Vec<u8>) -> Self {
        Self {
            handle,
            function,
            unique_id,
            payload,
            priority: Priority::Normal,
            created_at: Utc::now(),
            due_at: None,
            cron: None,
            background: false,
            durable: false,
            client_session: None,
            worker_session: None,
            numerator: 0,
            denominator: 0,
            state: JobState::Queued,
        }
    }
}
