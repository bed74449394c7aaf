//! JSON bodies exchanged over the broker.
//!
//! A [`ProcessingMessage`] asks a worker to run one OCR-D processor on a
//! workspace; the worker answers with a [`ResultMessage`] on the queue named
//! in `result_queue_name`.

use chrono::Utc;
use ocrd_core::job::JobState;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMessage {
    pub job_id: String,
    /// Executable name, `ocrd-*`.
    pub processor_name: String,
    /// Absolute path to the METS file. Either this or `workspace_id` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_to_mets: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub input_file_grps: Vec<String>,
    #[serde(default)]
    pub output_file_grps: Vec<String>,
    /// Page range, e.g. `PHYS_0001..PHYS_0005`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    /// Processor parameters, handed to the processor as `-p <json>`.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_queue_name: Option<String>,
    /// Workflow that submitted the job. Informational, never passed to the
    /// processor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Script path of that workflow on the submitting host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_script: Option<String>,
    /// Unix timestamp, seconds.
    pub created_time: i64,
}

impl ProcessingMessage {
    pub fn new(job_id: impl Into<String>, processor_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            processor_name: processor_name.into(),
            path_to_mets: None,
            workspace_id: None,
            input_file_grps: Vec::new(),
            output_file_grps: Vec::new(),
            page_id: None,
            overwrite: false,
            parameters: serde_json::Map::new(),
            log_level: None,
            result_queue_name: None,
            workflow_id: None,
            workflow_script: None,
            created_time: Utc::now().timestamp(),
        }
    }

    /// Decode and validate a delivery body.
    pub fn from_slice(body: &[u8]) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_slice(body)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        if self.job_id.trim().is_empty() {
            return Err(MessageError::Invalid("job_id is empty".into()));
        }
        if !self.processor_name.starts_with("ocrd-") {
            return Err(MessageError::Invalid(format!(
                "processor name '{}' does not start with 'ocrd-'",
                self.processor_name
            )));
        }
        if self.path_to_mets.is_none() && self.workspace_id.is_none() {
            return Err(MessageError::Invalid(
                "either path_to_mets or workspace_id is required".into(),
            ));
        }
        if self.input_file_grps.is_empty() {
            return Err(MessageError::Invalid("input_file_grps is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub job_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_to_mets: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp, seconds.
    pub finished_time: i64,
}

impl ResultMessage {
    /// Result for `request` in `state`, stamped now.
    pub fn for_request(
        request: &ProcessingMessage,
        state: JobState,
        error: Option<String>,
    ) -> Self {
        Self {
            job_id: request.job_id.clone(),
            state,
            path_to_mets: request.path_to_mets.clone(),
            workspace_id: request.workspace_id.clone(),
            error,
            finished_time: Utc::now().timestamp(),
        }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(body)?)
    }
}
