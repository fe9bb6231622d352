//! HTTP plumbing shared by every OpenAI-compatible upstream.

use std::time::Duration;

use reqwest::{
    Client, Response, StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap},
};
use secrecy::{ExposeSecret, SecretString};

use super::{ChatCall, FailureClass, ProviderFailure, ProviderReply, RateSignals, truncate_body};
use crate::{
    error::CatalogError,
    messages::{
        ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, ModelList, Role, Usage,
    },
    sse::read_chat_stream,
};

/// Embedding vectors together with what produced them.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Embeddings {
    pub(crate) vectors: Vec<Vec<f32>>,
    pub(crate) model: String,
    pub(crate) usage: Option<Usage>,
}

/// A client for `{base_url}/chat/completions`, `/models` and `/embeddings`.
pub(crate) struct OpenAiCompatible {
    client: Client,
    base_url: String,
}

impl OpenAiCompatible {
    /// `headers` are sent with every request. The client timeout bounds a whole attempt.
    pub(crate) fn new(base_url: &str, headers: HeaderMap, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).default_headers(headers).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) async fn chat(&self, call: ChatCall<'_>) -> Result<ProviderReply, ProviderFailure> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = ChatRequest {
            model: call.model,
            temperature: call.temperature,
            max_tokens: call.max_tokens,
            messages: [
                ChatMessage {
                    role: Role::System,
                    content: call.system,
                },
                ChatMessage {
                    role: Role::User,
                    content: call.user,
                },
            ],
            models: call.fallback_models,
            stream: call.stream,
        };

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, bearer(&call.account.key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFailure::transport(format!("Failed to send request to {url}: {e}")))?;

        let response = check_status(response).await?;
        let signals = RateSignals::from_headers(response.headers());

        if is_event_stream(&response) {
            let content = read_chat_stream(response.bytes_stream(), call.stream_idle_timeout)
                .await
                .map_err(|e| ProviderFailure {
                    class: FailureClass::Server { status: None },
                    message: e.to_string(),
                    signals,
                })?;

            return Ok(ProviderReply {
                model: call.model.to_string(),
                content: Some(content).filter(|c| !c.is_empty()),
                usage: None,
                signals,
            });
        }

        let text = response.text().await.map_err(|e| ProviderFailure {
            class: FailureClass::Server { status: None },
            message: format!("Failed to read response body: {e}"),
            signals,
        })?;

        let parsed: ChatResponse = sonic_rs::from_str(&text).map_err(|e| {
            log::error!("Failed to parse chat completion from {url}: {e}");

            ProviderFailure {
                class: FailureClass::Server { status: None },
                message: format!("Failed to parse chat completion: {e}"),
                signals,
            }
        })?;

        let model = if parsed.model.is_empty() {
            call.model.to_string()
        } else {
            parsed.model
        };

        let content = parsed.choices.into_iter().next().map(|choice| choice.message.content.unwrap_or_default());

        Ok(ProviderReply {
            model,
            content,
            usage: parsed.usage,
            signals,
        })
    }

    /// Lists model ids. `timeout` overrides the attempt timeout of the client.
    pub(crate) async fn list_models(&self, key: &SecretString, timeout: Duration) -> Result<Vec<String>, CatalogError> {
        let url = format!("{}/models", self.base_url);

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, bearer(key))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CatalogError::Connection(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CatalogError::Connection(e.to_string()))?;

        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                message: truncate_body(&text),
            });
        }

        let list: ModelList = sonic_rs::from_str(&text).map_err(|e| CatalogError::Decode(e.to_string()))?;

        Ok(list.data.into_iter().map(|model| model.id).collect())
    }

    pub(crate) async fn embeddings(
        &self,
        key: &SecretString,
        model: &str,
        input: &[String],
    ) -> Result<Embeddings, ProviderFailure> {
        let url = format!("{}/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, bearer(key))
            .json(&EmbeddingRequest { model, input })
            .send()
            .await
            .map_err(|e| ProviderFailure::transport(format!("Failed to send request to {url}: {e}")))?;

        let response = check_status(response).await?;
        let signals = RateSignals::from_headers(response.headers());

        let text = response.text().await.map_err(|e| ProviderFailure {
            class: FailureClass::Server { status: None },
            message: format!("Failed to read response body: {e}"),
            signals,
        })?;

        let parsed: EmbeddingResponse = sonic_rs::from_str(&text).map_err(|e| ProviderFailure {
            class: FailureClass::Server { status: None },
            message: format!("Failed to parse embeddings: {e}"),
            signals,
        })?;

        if parsed.data.is_empty() {
            return Err(ProviderFailure {
                class: FailureClass::Server { status: None },
                message: "Embeddings response carried no data".to_string(),
                signals,
            });
        }

        Ok(Embeddings {
            vectors: parsed.data.into_iter().map(|d| d.embedding).collect(),
            model: parsed.model,
            usage: parsed.usage,
        })
    }
}

fn bearer(key: &SecretString) -> String {
    format!("Bearer {}", key.expose_secret())
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

/// Passes 2xx responses through and turns everything else into a failure.
async fn check_status(response: Response) -> Result<Response, ProviderFailure> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let signals = RateSignals::from_headers(response.headers());
    let body = response.text().await.unwrap_or_default();
    let message = truncate_body(&body);

    log::debug!("Upstream answered {status}: {message}");

    let class = match status {
        StatusCode::TOO_MANY_REQUESTS => FailureClass::RateLimited,
        status if status.is_client_error() => FailureClass::Client {
            status: status.as_u16(),
        },
        status => FailureClass::Server {
            status: Some(status.as_u16()),
        },
    };

    Err(ProviderFailure {
        class,
        message,
        signals,
    })
}
