use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::keys::{input_key, output_key};

/// One caller's ordered command list for a switch, tracked as one queue entry.
///
/// Serialized as JSON with fields in declaration order, so every process
/// writes byte-identical payloads for the same batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub uuid: String,
    pub input_key: String,
    pub result_key: String,
    pub cmds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Batch {
    /// A fresh pending batch for `switch` with a new random id.
    pub fn new(switch: &str, cmds: Vec<String>) -> Self {
        let uuid = uuid::Uuid::new_v4().to_string();
        Self {
            input_key: input_key(switch, &uuid),
            result_key: output_key(switch, &uuid),
            uuid,
            cmds,
            result: None,
            error: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BatchError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BatchError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_completed(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    /// Record the device's output. Clears any previous error so the payload
    /// carries exactly one outcome.
    pub fn succeed(&mut self, output: String) {
        self.result = Some(output);
        self.error = None;
    }

    pub fn fail(&mut self, error: String) {
        self.error = Some(error);
        self.result = None;
    }
}

/// Caller-visible handle for a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub uuid: String,
    /// Revision at which the batch's input key was created. Orders the queue.
    pub create_revision: i64,
}
