//! HTTP client for the Graph-RAG chat service
//!
//! One POST to `<base>/api/chat` per test case.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::{ErrorKind, TestCase};

/// Target service call errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Timeout after {0:.1} seconds")]
    Timeout(f64),

    #[error("Connection failed to {0}")]
    Connection(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Timeout(_) => ErrorKind::Timeout,
            ServiceError::Connection(_) => ErrorKind::Connection,
            ServiceError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ServiceError::Rejected { .. } => ErrorKind::Rejected,
            ServiceError::RequestFailed(_) => ErrorKind::Other,
        }
    }

    /// Timeouts and connection errors are worth retrying
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Successful call outcome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub response_time_secs: f64,
    pub response_chars: usize,
    pub metadata: Option<serde_json::Value>,
}

/// Anything that can answer a test case
#[async_trait]
pub trait TargetService: Send + Sync {
    /// Run one test case, bounded by `timeout`
    async fn execute(
        &self,
        case: &TestCase,
        timeout: Duration,
    ) -> Result<ServiceResponse, ServiceError>;

    /// Endpoint identity, shared with parallel workers
    fn endpoint(&self) -> &str;
}

/// Request body of the chat endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub response_style: String,
    pub session_id: String,
    pub model: String,
    pub think_mode: bool,
}

impl ChatRequest {
    pub fn for_case(case: &TestCase) -> Self {
        Self {
            message: case.question.clone(),
            response_style: response_style(&case.user_type),
            session_id: format!("ab_test_{}", Uuid::new_v4().simple()),
            model: case.model.clone(),
            think_mode: case.think_mode,
        }
    }
}

/// "business user" -> "Business User"
pub fn response_style(user_type: &str) -> String {
    user_type
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// reqwest client for the Graph-RAG chat API
#[derive(Clone)]
pub struct GraphRagClient {
    client: Client,
    base_url: String,
}

impl GraphRagClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl TargetService for GraphRagClient {
    async fn execute(
        &self,
        case: &TestCase,
        timeout: Duration,
    ) -> Result<ServiceResponse, ServiceError> {
        let url = self.chat_url();
        let payload = ChatRequest::for_case(case);
        debug!("POST {} ({})", url, case);

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, &url, timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify(e, &url, timeout))?;
        let response_time_secs = start.elapsed().as_secs_f64();

        if status.is_client_error() {
            return Err(ServiceError::Rejected {
                status: status.as_u16(),
                message: truncate(&body, 200),
            });
        }
        if !status.is_success() {
            return Err(ServiceError::RequestFailed(format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| ServiceError::MalformedResponse(e.to_string()))?;
        let answer = value
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| {
                ServiceError::MalformedResponse("missing 'response' field".to_string())
            })?;

        debug!("Response in {:.2}s ({} chars)", response_time_secs, answer.len());

        Ok(ServiceResponse {
            response_time_secs,
            response_chars: answer.chars().count(),
            metadata: value.get("metadata").cloned(),
        })
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }
}

fn classify(e: reqwest::Error, url: &str, timeout: Duration) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout(timeout.as_secs_f64())
    } else if e.is_connect() {
        ServiceError::Connection(url.to_string())
    } else if e.is_decode() {
        ServiceError::MalformedResponse(e.to_string())
    } else {
        ServiceError::RequestFailed(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}
