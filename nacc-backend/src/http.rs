//! HTTP-remote backend: one generic JSON completion endpoint.
//!
//! POSTs `{model, prompt, context}` and expects `{"completion": "..."}`.
//! Provider-specific wire formats live behind operator-run gateways; this
//! client only knows the generic shape.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{BackendContext, BackendError, LlmBackend};

#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint_url: String,
    model_name: String,
    bearer_token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    completion: Option<String>,
}

impl HttpBackend {
    pub fn new(
        endpoint_url: String,
        model_name: String,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        if endpoint_url.is_empty() {
            return Err(BackendError::Config(
                "http backend requires endpoint_url".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::Config(err.to_string()))?;
        Ok(Self {
            client,
            endpoint_url,
            model_name,
            bearer_token,
            timeout,
        })
    }
}

#[async_trait]
impl LlmBackend for HttpBackend {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn complete(
        &self,
        prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": self.model_name,
            "prompt": prompt,
            "context": context,
        });

        let mut request = self.client.post(&self.endpoint_url).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                BackendError::Timeout(self.timeout)
            } else {
                BackendError::Unavailable(err.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let detail = response.text().await.unwrap_or_default();
            return Err(BackendError::RateLimited(detail));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BackendError::Unavailable(format!("{status}: {detail}")));
        }

        let parsed: CompletionBody = response
            .json()
            .await
            .map_err(|err| BackendError::Malformed(err.to_string()))?;
        parsed.completion.ok_or_else(|| {
            BackendError::Malformed("response is missing the 'completion' field".to_string())
        })
    }
}
