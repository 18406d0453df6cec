//! Oracle Module
//!
//! The generative-text collaborator. The core only ever sees it through the
//! [`Oracle`] trait: a list of chat messages in, untrusted text out.

mod cache;
mod provider;
mod response;

pub use cache::{CachedOracle, ResponseCache};
pub use provider::{OpenAICompatibleOracle, RetryingOracle};
pub use response::{
    extract_json_object, parse_dichotomy_pool, parse_oracle_output, Action, DuelOptions, Metadata,
    OracleResponse, OracleTurn, Phase, Recommendation, Statut, ValidationError,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleReply {
    pub content: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle call timed out")]
    Timeout,
    #[error("oracle server error (HTTP {0})")]
    Server(u16),
    #[error("oracle rejected the request (HTTP {status}): {body}")]
    Client { status: u16, body: String },
    #[error("oracle transport error: {0}")]
    Transport(String),
    #[error("oracle reply could not be read: {0}")]
    Malformed(String),
}

impl OracleError {
    /// Timeouts, 5xx and connection failures are worth one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Timeout | OracleError::Server(_) | OracleError::Transport(_))
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn call(&self, request: OracleRequest) -> Result<OracleReply, OracleError>;
}
