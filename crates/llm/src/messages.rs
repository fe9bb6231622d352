//! OpenAI-compatible wire types spoken by every upstream provider.

use serde::{Deserialize, Serialize};

/// Chat completion request body.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) temperature: f32,
    pub(crate) max_tokens: u32,
    pub(crate) messages: [ChatMessage<'a>; 2],
    /// Ordered fallback models the upstream may try on its own.
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub(crate) models: &'a [String],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub(crate) stream: bool,
}

/// One chat message.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatMessage<'a> {
    pub(crate) role: Role,
    pub(crate) content: &'a str,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Role {
    System,
    User,
}

/// Non-streamed chat completion response.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub(crate) model: String,
    #[serde(default)]
    pub(crate) choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub(crate) usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResponseChoice {
    #[serde(default)]
    pub(crate) message: ContentHolder,
}

/// `{ "content": ... }`, shared by `message` and `delta` objects.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ContentHolder {
    #[serde(default)]
    pub(crate) content: Option<String>,
}

/// One server-sent chunk of a streamed chat completion.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamChunk {
    #[serde(default)]
    pub(crate) choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChoice {
    #[serde(default)]
    pub(crate) delta: Option<ContentHolder>,
    #[serde(default)]
    pub(crate) message: Option<ContentHolder>,
}

impl StreamChoice {
    /// The delta content, falling back to a full message content.
    pub(crate) fn content(&self) -> Option<&str> {
        fn non_empty(holder: &Option<ContentHolder>) -> Option<&str> {
            holder
                .as_ref()
                .and_then(|h| h.content.as_deref())
                .filter(|c| !c.is_empty())
        }

        non_empty(&self.delta).or_else(|| non_empty(&self.message))
    }
}

/// Token usage reported by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Sum of both.
    #[serde(default)]
    pub total_tokens: u32,
}

/// `GET /models` response of OpenAI-compatible APIs.
#[derive(Debug, Deserialize)]
pub(crate) struct ModelList {
    #[serde(default)]
    pub(crate) data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelEntry {
    pub(crate) id: String,
}

/// Embeddings request body.
#[derive(Debug, Serialize)]
pub(crate) struct EmbeddingRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) input: &'a [String],
}

/// Embeddings response body.
#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingResponse {
    #[serde(default)]
    pub(crate) data: Vec<EmbeddingData>,
    #[serde(default)]
    pub(crate) model: String,
    #[serde(default)]
    pub(crate) usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingData {
    pub(crate) embedding: Vec<f32>,
}
