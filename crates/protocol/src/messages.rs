//! Request and response bodies for the mutation endpoints

use serde::{Deserialize, Serialize};

/// Body of `POST /bind` and `POST /unbind`
///
/// The busid is kept as a raw string here so a malformed identifier can be
/// reported as a validation failure rather than a body parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    pub busid: String,
}

/// Outcome of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failed,
}

/// Response body of `POST /bind` and `POST /unbind`
///
/// `{"status":"success"}` or `{"status":"failed","error":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResponse {
    pub fn success() -> Self {
        Self {
            status: OperationStatus::Success,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}
