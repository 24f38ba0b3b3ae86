use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use morph_core::errors::TransportError;
use morph_core::messages::ModelResponse;
use morph_core::transport::{ModelBackend, ModelRequest};
use morph_settings::{AccessMode, ModelAccessSettings};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where model calls go. Both network modes POST the same body; only the
/// URL and auth headers differ.
pub enum Endpoint {
    Unconfigured,
    Direct { url: String, api_key: SecretString },
    Relay { url: String, token: Option<SecretString> },
}

impl Endpoint {
    pub fn from_settings(settings: &ModelAccessSettings) -> Self {
        match settings.mode {
            AccessMode::Unconfigured => Self::Unconfigured,
            AccessMode::Direct => match settings.api_key.as_deref() {
                Some(key) if !key.is_empty() => Self::Direct {
                    url: settings.direct_url.clone(),
                    api_key: SecretString::from(key.to_owned()),
                },
                _ => Self::Unconfigured,
            },
            AccessMode::Relay => match settings.relay_url.as_deref() {
                Some(url) if !url.is_empty() => Self::Relay {
                    url: url.to_owned(),
                    token: settings
                        .relay_token
                        .as_deref()
                        .filter(|t| !t.is_empty())
                        .map(|t| SecretString::from(t.to_owned())),
                },
                _ => Self::Unconfigured,
            },
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Direct { .. } => "direct",
            Self::Relay { .. } => "relay",
        }
    }
}

/// Model backend speaking the messages wire format over HTTP.
pub struct HttpBackend {
    client: Client,
    endpoint: Endpoint,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn from_settings(settings: &ModelAccessSettings) -> Result<Self, TransportError> {
        Self::new(Endpoint::from_settings(settings), settings.timeout())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn build_request(&self, request: &ModelRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut req = match &self.endpoint {
            Endpoint::Unconfigured => return Err(TransportError::NotConfigured),
            Endpoint::Direct { url, api_key } => self
                .client
                .post(url)
                .header("x-api-key", api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
            Endpoint::Relay { url, token } => {
                let req = self.client.post(url);
                match token {
                    Some(token) => req.header("Authorization", format!("Bearer {}", token.expose_secret())),
                    None => req,
                }
            }
        };
        req = req.header("accept", "application/json");
        req = req.header("content-type", "application/json");
        Ok(req.json(request))
    }

    fn map_send_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    fn name(&self) -> &str {
        self.endpoint.mode_name()
    }

    #[instrument(skip_all, fields(mode = self.endpoint.mode_name(), model = %request.model))]
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, TransportError> {
        let req = self.build_request(request)?;

        let resp = req.send().await.map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await.map_err(|e| self.map_send_error(e))?;
        debug!(bytes = body.len(), "model response received");
        serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_core::messages::{ContentBlock, Message};
    use serde_json::json;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ModelRequest {
        ModelRequest {
            system: "sys".into(),
            messages: vec![Message::user_text("hi")],
            model: "claude-test".into(),
            max_tokens: 64,
            tools: Vec::new(),
            tool_choice: None,
            extra: Default::default(),
        }
    }

    fn reply() -> serde_json::Value {
        json!({
            "id": "msg_1",
            "model": "claude-test",
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "toolu_1", "name": "respond", "input": {"content": "x"}}
            ],
            "stop_reason": "tool_use"
        })
    }

    #[tokio::test]
    async fn unconfigured_fails_without_network() {
        let backend = HttpBackend::new(Endpoint::Unconfigured, Duration::from_secs(1)).unwrap();
        let err = backend.complete(&request()).await.unwrap_err();
        assert_eq!(err, TransportError::NotConfigured);
    }

    #[tokio::test]
    async fn direct_mode_sends_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply()))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::new(
            Endpoint::Direct {
                url: format!("{}/v1/messages", server.uri()),
                api_key: SecretString::from("sk-test"),
            },
            Duration::from_secs(5),
        )
        .unwrap();

        let resp = backend.complete(&request()).await.unwrap();
        assert_eq!(resp.text_content(), "hello");
        assert_eq!(resp.tool_calls().len(), 1);
        assert!(matches!(resp.content[1], ContentBlock::ToolUse { .. }));
    }

    #[tokio::test]
    async fn relay_mode_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(header("authorization", "Bearer relay-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply()))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::new(
            Endpoint::Relay {
                url: format!("{}/chat", server.uri()),
                token: Some(SecretString::from("relay-secret")),
            },
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(backend.complete(&request()).await.is_ok());
    }

    #[tokio::test]
    async fn relay_without_token_sends_no_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply()))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(
            Endpoint::Relay {
                url: server.uri(),
                token: None,
            },
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(backend.complete(&request()).await.is_ok());
    }

    #[tokio::test]
    async fn non_2xx_maps_to_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(
            Endpoint::Relay {
                url: server.uri(),
                token: None,
            },
            Duration::from_secs(5),
        )
        .unwrap();

        let err = backend.complete(&request()).await.unwrap_err();
        assert_eq!(err.to_string(), "529: overloaded");
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(
            Endpoint::Relay {
                url: server.uri(),
                token: None,
            },
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(matches!(
            backend.complete(&request()).await,
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn endpoint_from_settings_falls_back_to_unconfigured() {
        let mut settings = ModelAccessSettings {
            mode: AccessMode::Direct,
            ..Default::default()
        };
        assert_eq!(Endpoint::from_settings(&settings).mode_name(), "unconfigured");

        settings.api_key = Some("sk".into());
        assert_eq!(Endpoint::from_settings(&settings).mode_name(), "direct");

        settings.mode = AccessMode::Relay;
        settings.relay_url = Some("http://relay".into());
        assert_eq!(Endpoint::from_settings(&settings).mode_name(), "relay");
    }
}
