//! API Handlers
//!
//! HTTP request handlers for each cache server endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheDriver, CacheOptions, TypedValue};
use crate::error::{CacheError, Result};
use crate::models::{
    CounterRequest, ExistsResponse, ExpireRequest, HealthResponse, MessageResponse, SetRequest,
    ValueResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Driver serving every request
    pub cache: Arc<dyn CacheDriver>,
}

impl AppState {
    pub fn new(cache: Arc<dyn CacheDriver>) -> Self {
        Self { cache }
    }
}

fn to_json(value: Option<TypedValue>) -> Value {
    value.map_or(Value::Null, |value| value.to_json())
}

/// Handler for PUT /set
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<MessageResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidArgument(error_msg));
    }

    let options = req.options();
    let value = TypedValue::from(req.value);
    state.cache.set(&req.key, value, options).await?;

    Ok(Json(MessageResponse::set(req.key)))
}

/// Handler for GET /get/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ValueResponse>> {
    let value = state.cache.get(&key, CacheOptions::new()).await?;
    Ok(Json(ValueResponse::new(key, to_json(value))))
}

/// Handler for GET /exists/:key
pub async fn exists_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ExistsResponse>> {
    let exists = state.cache.exists(&key).await?;
    Ok(Json(ExistsResponse::new(key, exists)))
}

/// Handler for DELETE /del/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<MessageResponse>> {
    state.cache.remove(&key).await?;
    Ok(Json(MessageResponse::deleted(key)))
}

/// Handler for POST /incr/:key
pub async fn increment_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Option<Json<CounterRequest>>,
) -> Result<Json<ValueResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let value = state.cache.increment(&key, req.delta(), req.options()).await?;
    Ok(Json(ValueResponse::new(key, to_json(value))))
}

/// Handler for POST /decr/:key
pub async fn decrement_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Option<Json<CounterRequest>>,
) -> Result<Json<ValueResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let value = state.cache.decrement(&key, req.delta(), req.options()).await?;
    Ok(Json(ValueResponse::new(key, to_json(value))))
}

/// Handler for POST /expire/:key
pub async fn expire_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Option<Json<ExpireRequest>>,
) -> Result<Json<MessageResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    state.cache.expire(&key, req.ttl).await?;
    Ok(Json(MessageResponse::expiry_updated(key)))
}

/// Handler for POST /invalidate
pub async fn invalidate_handler(State(state): State<AppState>) -> Result<Json<MessageResponse>> {
    state.cache.invalidate().await?;
    debug!("namespace invalidated through the API");
    Ok(Json(MessageResponse::invalidated()))
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(state.cache.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DriverConfig, MemoryDriver};
    use serde_json::json;

    fn state() -> AppState {
        AppState::new(Arc::new(MemoryDriver::new(DriverConfig::new())))
    }

    fn set_request(key: &str, value: Value) -> SetRequest {
        SetRequest {
            key: key.to_string(),
            value,
            ttl: None,
            overwrite: None,
        }
    }

    #[tokio::test]
    async fn test_set_and_get_handler() {
        let state = state();

        let req = set_request("test_key", json!({"a": 1}));
        let result = set_handler(State(state.clone()), Json(req)).await;
        assert!(result.is_ok());

        let response = get_handler(State(state.clone()), Path("test_key".to_string()))
            .await
            .unwrap();
        assert_eq!(response.value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_get_nonexistent_key() {
        let result = get_handler(State(state()), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(CacheError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_handler() {
        let state = state();
        set_handler(State(state.clone()), Json(set_request("to_delete", json!("v"))))
            .await
            .unwrap();

        let result = delete_handler(State(state.clone()), Path("to_delete".to_string())).await;
        assert!(result.is_ok());

        let response = exists_handler(State(state), Path("to_delete".to_string()))
            .await
            .unwrap();
        assert!(!response.exists);
    }

    #[tokio::test]
    async fn test_counter_handlers() {
        let state = state();
        let req = CounterRequest {
            delta: Some(5),
            create: Some(true),
        };
        let response = increment_handler(State(state.clone()), Path("c".to_string()), Some(Json(req)))
            .await
            .unwrap();
        assert_eq!(response.value, json!(5));

        let response = decrement_handler(State(state), Path("c".to_string()), None)
            .await
            .unwrap();
        assert_eq!(response.value, json!(4));
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler(State(state())).await;
        assert_eq!(response.status, "healthy");
        assert_eq!(response.driver, "memory");
    }

    #[tokio::test]
    async fn test_set_invalid_request() {
        let req = set_request("", json!("value"));
        let result = set_handler(State(state()), Json(req)).await;
        assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
    }
}
