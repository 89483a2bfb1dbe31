//! Request and response bodies for the ingest front end.
//!
//! ```json
//! POST /
//! {"topic": "clicks", "key": "user-42", "data": "{\"page\":\"/home\"}"}
//! ```
//!
//! `key` and `data` are optional and default to empty strings. An empty key
//! means the message has no key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize, Clone)]
pub struct ProduceRequest {
    pub topic: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProduceResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Health per producer in chain order
    pub components: BTreeMap<String, String>,
    pub lost: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub version: String,
}
