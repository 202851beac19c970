//! Response DTOs for the cache server API
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;
use serde_json::Value;

/// Response body for GET /get/:key and the counter endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ValueResponse {
    pub key: String,
    /// Stored value; big integers render as strings
    pub value: Value,
}

impl ValueResponse {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Response body for GET /exists/:key
#[derive(Debug, Clone, Serialize)]
pub struct ExistsResponse {
    pub key: String,
    pub exists: bool,
}

impl ExistsResponse {
    pub fn new(key: impl Into<String>, exists: bool) -> Self {
        Self {
            key: key.into(),
            exists,
        }
    }
}

/// Response body for the write endpoints (set, delete, expire, invalidate)
#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    /// Success message
    pub message: String,
    /// Affected key, absent for namespace-wide operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl MessageResponse {
    pub fn set(key: impl Into<String>) -> Self {
        Self::for_key(key, "set")
    }

    pub fn deleted(key: impl Into<String>) -> Self {
        Self::for_key(key, "deleted")
    }

    pub fn expiry_updated(key: impl Into<String>) -> Self {
        Self::for_key(key, "expiry updated")
    }

    pub fn invalidated() -> Self {
        Self {
            message: "Namespace invalidated successfully".to_string(),
            key: None,
        }
    }

    fn for_key(key: impl Into<String>, action: &str) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' {} successfully", key, action),
            key: Some(key),
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Active backend
    pub driver: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy(driver: impl Into<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            driver: driver.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_response_serialize() {
        let resp = ValueResponse::new("test_key", json!({"n": 1}));
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"key":"test_key","value":{"n":1}}"#);
    }

    #[test]
    fn test_message_response_serialize() {
        let json = serde_json::to_string(&MessageResponse::set("my_key")).unwrap();
        assert!(json.contains("my_key"));
        assert!(json.contains("successfully"));

        let json = serde_json::to_string(&MessageResponse::invalidated()).unwrap();
        assert!(!json.contains("key"));
    }

    #[test]
    fn test_health_response_serialize() {
        let resp = HealthResponse::healthy("memory");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("memory"));
        assert!(json.contains("timestamp"));
    }
}
