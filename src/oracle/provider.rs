use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Oracle, OracleError, OracleReply, OracleRequest, Usage};

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAICompatibleOracle {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAICompatibleOracle {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }
}

fn transport_error(err: reqwest::Error) -> OracleError {
    if err.is_timeout() {
        OracleError::Timeout
    } else {
        OracleError::Transport(err.to_string())
    }
}

#[async_trait]
impl Oracle for OpenAICompatibleOracle {
    async fn call(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);

        if let Some(ref key) = self.api_key {
            http = http.bearer_auth(key);
        }

        let res = http.send().await.map_err(transport_error)?;
        let status = res.status();
        if status.is_server_error() {
            return Err(OracleError::Server(status.as_u16()));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(OracleError::Client { status: status.as_u16(), body });
        }

        let json: serde_json::Value = res.json().await.map_err(transport_error)?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| OracleError::Malformed("missing choices[0].message.content".to_string()))?;

        let usage = json.get("usage").map(|u| Usage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(OracleReply { content: content.to_string(), usage })
    }
}

/// Bounds each call with a timeout and retries once, after a fixed delay,
/// on transient failures.
pub struct RetryingOracle {
    inner: Arc<dyn Oracle>,
    timeout: Duration,
    retry_delay: Duration,
}

impl RetryingOracle {
    pub fn new(inner: Arc<dyn Oracle>, timeout: Duration, retry_delay: Duration) -> Self {
        Self { inner, timeout, retry_delay }
    }

    async fn attempt(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        match tokio::time::timeout(self.timeout, self.inner.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout),
        }
    }
}

#[async_trait]
impl Oracle for RetryingOracle {
    async fn call(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        match self.attempt(request.clone()).await {
            Err(e) if e.is_transient() => {
                warn!("Oracle call failed ({}), retrying in {:?}", e, self.retry_delay);
                tokio::time::sleep(self.retry_delay).await;
                let reply = self.attempt(request).await?;
                debug!("Oracle retry succeeded");
                Ok(reply)
            }
            other => other,
        }
    }
}
