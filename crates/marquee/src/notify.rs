//! # Worker Correlation Envelope
//!
//! [`AsyncNotify`] is what crosses the boundary between an actor and its worker pools. The
//! requester fills in the alias, the call id (its resumable task id) and the operation; the
//! worker flips the status to [`NotifyStatus::Reply`] and fills in the outcome; the actor
//! hands the reply back to the waiting task through
//! [`TaskTable::resume`](crate::tasks::TaskTable::resume).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tasks::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    Request,
    Reply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncNotify {
    /// Worker pool that should run the operation.
    pub alias: String,
    /// Id of the task waiting for the reply.
    pub call_id: TaskId,
    pub operation: String,
    pub payload: Value,
    pub status: NotifyStatus,
    pub success: bool,
    pub result: Option<Value>,
}

impl AsyncNotify {
    pub fn request(
        alias: impl Into<String>,
        call_id: TaskId,
        operation: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            alias: alias.into(),
            call_id,
            operation: operation.into(),
            payload,
            status: NotifyStatus::Request,
            success: false,
            result: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.status == NotifyStatus::Request
    }

    pub fn is_reply(&self) -> bool {
        self.status == NotifyStatus::Reply
    }

    /// Turns a request into its reply. Failures are recorded as `{"error": "..."}`.
    pub fn into_reply(mut self, outcome: anyhow::Result<Value>) -> Self {
        self.status = NotifyStatus::Reply;
        match outcome {
            Ok(result) => {
                self.success = true;
                self.result = Some(result);
            }
            Err(e) => {
                self.success = false;
                self.result = Some(json!({ "error": e.to_string() }));
            }
        }
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        if self.success {
            return None;
        }
        self.result
            .as_ref()
            .and_then(|r| r.get("error"))
            .and_then(Value::as_str)
    }
}
