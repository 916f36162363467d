//! Outbound command contracts.

use serde::{Deserialize, Serialize};

/// Ask the analysis service to process an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAnalysis {
    pub correlation_id: String,
    pub object_key: String,
}

impl RequestAnalysis {
    /// Exchange the analysis service consumes commands from.
    pub const EXCHANGE: &'static str = "analysis.requests";

    /// Create a request with a fresh correlation id.
    pub fn new(object_key: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            object_key: object_key.into(),
        }
    }
}
