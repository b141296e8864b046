//! Durable job records in an embedded ordered key/value store.
//!
//! Keys are job handles; values are bincode-encoded [`JobRecord`] tuples.
//! The broker never issues concurrent writes for the same handle, so plain
//! insert/remove is enough. Writes are flushed before the caller responds
//! with JOB_CREATED; a crash between dispatch and completion leaves the
//! record to be replayed as Queued on restart.

use std::path::Path;

use bincode::{Decode, Encode};

use crate::broker::job::{Job, Priority};
use crate::error::{GearError, Result};

/// On-disk form of a durable job.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct JobRecord {
    pub function: String,
    pub priority: Priority,
    pub unique_id: String,
    /// Epoch seconds; 0 means immediately eligible.
    pub due_at: i64,
    /// Five-field cron expression for recurring jobs.
    pub cron: Option<String>,
    pub payload: Vec<u8>,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            function: job.function.clone(),
            priority: job.priority,
            unique_id: job.unique_id.clone(),
            due_at: job.due_at.map(|t| t.timestamp()).unwrap_or(0),
            cron: job.cron.clone(),
            payload: job.payload.clone(),
        }
    }
}

pub struct JobStore {
    db: sled::Db,
}

impl JobStore {
    pub fn open(dir: &Path) -> Result<Self> {
        let db = sled::open(dir)?;
        Ok(Self { db })
    }

    /// Write and flush one record. Completion of this call is the durability
    /// point for the submit path.
    pub async fn put(&self, handle: &str, record: &JobRecord) -> Result<()> {
        let bytes = bincode::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| GearError::Internal(format!("encode job record: {e}")))?;
        self.db.insert(handle.as_bytes(), bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn delete(&self, handle: &str) -> Result<()> {
        self.db.remove(handle.as_bytes())?;
        Ok(())
    }

    /// Replay every stored record, invoked once at startup.
    pub fn range(&self, mut callback: impl FnMut(String, JobRecord)) -> Result<()> {
        for entry in self.db.iter() {
            let (key, value) = entry?;
            let handle = String::from_utf8_lossy(&key).to_string();
            let (record, _) =
                bincode::decode_from_slice::<JobRecord, _>(&value, bincode::config::standard())
                    .map_err(|e| GearError::Internal(format!("decode job record: {e}")))?;
            callback(handle, record);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}
