use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use conductor_core::completion::{Completion, CompletionGateway, CompletionRequest, ProviderKind};
use conductor_core::errors::GatewayError;

use crate::converter;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Where a provider lives and how to authenticate against it.
#[derive(Debug)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
}

impl EndpointConfig {
    pub fn openai(api_key: Option<SecretString>) -> Self {
        Self {
            base_url: OPENAI_BASE_URL.into(),
            api_key,
        }
    }

    /// Ollama accepts any bearer token; it sends "ollama" by convention.
    pub fn ollama() -> Self {
        Self {
            base_url: OLLAMA_BASE_URL.into(),
            api_key: Some(SecretString::from("ollama")),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Chat-completions client shared by every provider speaking the OpenAI protocol.
pub struct OpenAiGateway {
    client: Client,
    endpoints: HashMap<ProviderKind, EndpointConfig>,
}

impl OpenAiGateway {
    pub fn new(endpoints: HashMap<ProviderKind, EndpointConfig>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoints })
    }

    /// OpenAI with the given key plus a local Ollama endpoint.
    pub fn with_defaults(openai_key: Option<SecretString>) -> Result<Self, GatewayError> {
        let mut endpoints = HashMap::new();
        endpoints.insert(ProviderKind::OpenAi, EndpointConfig::openai(openai_key));
        endpoints.insert(ProviderKind::Ollama, EndpointConfig::ollama());
        Self::new(endpoints)
    }

    fn endpoint(&self, provider: ProviderKind) -> Result<&EndpointConfig, GatewayError> {
        self.endpoints
            .get(&provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_transport(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(REQUEST_TIMEOUT)
    } else {
        GatewayError::NetworkError(e.to_string())
    }
}

#[async_trait]
impl CompletionGateway for OpenAiGateway {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    #[instrument(skip(self, request), fields(role = %request.role, provider = %request.selection.provider, model = %request.selection.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, GatewayError> {
        let endpoint = self.endpoint(request.selection.provider)?;
        let body = converter::build_request_body(&request);

        let mut req = self
            .client
            .post(endpoint.completions_url())
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &endpoint.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.map_err(classify_transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let hint = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body, hint));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        converter::parse_response(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::completion::{AgentRole, ModelSelection};
    use conductor_core::messages::ChatMessage;

    #[test]
    fn completions_url_trims_slash() {
        let endpoint = EndpointConfig {
            base_url: "http://localhost:8080/v1/".into(),
            api_key: None,
        };
        assert_eq!(endpoint.completions_url(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(
            EndpointConfig::ollama().completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn retry_after_header_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        assert_eq!(retry_after(&reqwest::header::HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected_before_any_request() {
        let mut endpoints = HashMap::new();
        endpoints.insert(ProviderKind::OpenAi, EndpointConfig::openai(None));
        let gateway = OpenAiGateway::new(endpoints).unwrap();
        let request = CompletionRequest::new(
            AgentRole::Coder,
            ModelSelection::new(ProviderKind::Ollama, "llama3"),
            vec![ChatMessage::user("hi")],
        );
        let err = gateway.complete(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownProvider(p) if p == "ollama"));
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            ProviderKind::Ollama,
            EndpointConfig {
                base_url: "http://127.0.0.1:1/v1".into(),
                api_key: None,
            },
        );
        let gateway = OpenAiGateway::new(endpoints).unwrap();
        let request = CompletionRequest::new(
            AgentRole::Worker,
            ModelSelection::new(ProviderKind::Ollama, "llama3"),
            vec![ChatMessage::user("hi")],
        );
        let err = gateway.complete(request).await.unwrap_err();
        assert!(err.is_retryable(), "got: {err:?}");
    }
}
