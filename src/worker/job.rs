//! The job view handed to worker functions.

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{Packet, PacketType};

use super::agent::Agent;

/// An assignment received from the server. Job functions use it to read the
/// payload and to stream progress back to the originating client.
pub struct WorkerJob {
    handle: String,
    function: String,
    unique_id: String,
    data: Vec<u8>,
    agent: Arc<Agent>,
}

impl WorkerJob {
    pub(crate) fn new(
        handle: String,
        function: String,
        unique_id: String,
        data: Vec<u8>,
        agent: Arc<Agent>,
    ) -> Self {
        Self {
            handle,
            function,
            unique_id,
            data,
            agent,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Stream intermediate data to the client while the job is running.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.agent
            .write_packet(&Packet::request(
                PacketType::WorkData,
                Packet::join(&[self.handle.as_bytes(), data]),
            ))
            .await
    }

    pub async fn send_warning(&self, data: &[u8]) -> Result<()> {
        self.agent
            .write_packet(&Packet::request(
                PacketType::WorkWarning,
                Packet::join(&[self.handle.as_bytes(), data]),
            ))
            .await
    }

    /// Report progress as numerator/denominator counters.
    pub async fn update_status(&self, numerator: u64, denominator: u64) -> Result<()> {
        self.agent
            .write_packet(&Packet::request(
                PacketType::WorkStatus,
                Packet::join(&[
                    self.handle.as_bytes(),
                    numerator.to_string().as_bytes(),
                    denominator.to_string().as_bytes(),
                ]),
            ))
            .await
    }
}
