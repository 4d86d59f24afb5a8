use axum::http::StatusCode;

use crate::load_balancer::LoadBalanceMethod;

/// Startup configuration errors. Any of these prevents the router from starting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not a valid load balance method")]
    UnknownLoadBalanceMethod(String),

    #[error("unsupported load balance method: {0}")]
    UnsupportedLoadBalanceMethod(LoadBalanceMethod),
}

/// A stats report that does not match `ip,port,availableMemory,numRunning,numWaiting`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatsParseError {
    #[error("expected 5 comma-separated fields, got {0}")]
    FieldCount(usize),

    #[error("empty ip field")]
    EmptyIp,

    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Why a single backend call produced no payload.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to build request for {url}: {reason}")]
    InvalidRequest { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),

    #[error("backend returned status {0}")]
    Status(StatusCode),

    #[error("failed to read response body: {0}")]
    Body(#[from] axum::Error),
}
