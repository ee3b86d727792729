//! Wire types for manager/worker HTTP communication
//!
//! Both processes speak JSON over HTTP/1.1. The manager mirrors the worker's
//! `/tasks` surface so clients can submit events and inspect the cluster view
//! with the same request shapes.

use serde::{Deserialize, Serialize};

/// Error body returned by either API on a non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrResponse {
    #[serde(rename = "HTTPStatusCode")]
    pub http_status_code: u16,
    #[serde(rename = "Message")]
    pub message: String,
}

impl ErrResponse {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status_code: status,
            message: message.into(),
        }
    }
}

/// API endpoint paths shared by both surfaces.
pub mod endpoints {
    pub const TASKS: &str = "/tasks";
    pub const STATS: &str = "/stats";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_err_response_field_names() {
        let e = ErrResponse::new(400, "invalid transition");
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"HTTPStatusCode\":400"));
        assert!(json.contains("\"Message\":\"invalid transition\""));

        let back: ErrResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.http_status_code, 400);
        assert_eq!(back.message, "invalid transition");
    }
}
