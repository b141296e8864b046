//! Per-function priority FIFOs and sleeping-worker sets.
//!
//! All mutation happens under the broker-wide lock; nothing here performs
//! I/O or blocks.

use std::collections::{HashMap, VecDeque};

use super::job::Priority;

/// Queues and the sleeping-worker set for one function name.
#[derive(Debug, Default)]
pub struct FunctionQueues {
    high: VecDeque<String>,
    normal: VecDeque<String>,
    low: VecDeque<String>,
    /// Worker sessions that sent PRE_SLEEP while advertising this function,
    /// in insertion order so wakeups distribute fairly.
    sleeping: VecDeque<u64>,
    max_queue: Option<usize>,
}

impl FunctionQueues {
    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<String> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    /// Append a handle; returns false when the per-function cap is hit.
    pub fn push(&mut self, priority: Priority, handle: String) -> bool {
        if let Some(max) = self.max_queue {
            if self.queued_len() >= max {
                return false;
            }
        }
        self.queue_mut(priority).push_back(handle);
        true
    }

    /// Re-queue a handle at the front of its priority level, used when a
    /// worker dies with the job assigned.
    pub fn push_front(&mut self, priority: Priority, handle: String) {
        self.queue_mut(priority).push_front(handle);
    }

    /// Pop the next handle, scanning HIGH then NORMAL then LOW.
    pub fn pop(&mut self) -> Option<String> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Drop one queued handle wherever it sits.
    pub fn remove(&mut self, handle: &str) -> bool {
        for queue in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(pos) = queue.iter().position(|h| h == handle) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn queued_len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued_len() == 0
    }

    pub fn set_max_queue(&mut self, max: Option<usize>) {
        self.max_queue = max;
    }

    pub fn add_sleeper(&mut self, session: u64) {
        if !self.sleeping.contains(&session) {
            self.sleeping.push_back(session);
        }
    }

    /// Pop the longest-sleeping worker, if any.
    pub fn take_sleeper(&mut self) -> Option<u64> {
        self.sleeping.pop_front()
    }

    pub fn remove_sleeper(&mut self, session: u64) {
        self.sleeping.retain(|s| *s != session);
    }
}

/// The queue map for every known function name.
#[derive(Debug, Default)]
pub struct QueueCore {
    functions: HashMap<String, FunctionQueues>,
}

impl QueueCore {
    pub fn function_mut(&mut self, function: &str) -> &mut FunctionQueues {
        self.functions.entry(function.to_string()).or_default()
    }

    pub fn function(&self, function: &str) -> Option<&FunctionQueues> {
        self.functions.get(function)
    }

    pub fn functions(&self) -> impl Iterator<Item = (&String, &FunctionQueues)> {
        self.functions.iter()
    }

    /// Remove a session from every sleeping set, on grab or disconnect.
    pub fn remove_sleeper_everywhere(&mut self, session: u64) {
        for queues in self.functions.values_mut() {
            queues.remove_sleeper(session);
        }
    }

    pub fn queued_total(&self) -> usize {
        self.functions.values().map(|q| q.queued_len()).sum()
    }
}
