use crate::embeddings::Embedding;
use crate::error::{RagError, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::env;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_EMBEDDING_MODEL: &str = "models/text-embedding-004";
const DEFAULT_GENERATION_MODEL: &str = "models/gemini-2.0-flash";

/// Output size of text-embedding-004
pub const GEMINI_EMBEDDING_DIM: usize = 768;

const SYSTEM_PROMPT: &str = "You are an AI assistant that answers questions using the provided documents.

POLICY:
1. Base answers only on the given context; do not fabricate details.
2. Use a neutral, professional tone. Do NOT assume any person's identity.
3. Refer to people in the third person (use their name or \"they/them\").
4. If the context is insufficient, say so and suggest what is missing.
5. Keep responses concise and directly address the user's question.
6. Do not add citations inline; the app will show sources separately.";

/// Configuration for Gemini API
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub embedding_model: String,
    pub generation_model: String,
    /// Requested embedding size; text-embedding-004 can truncate below its native 768
    pub embedding_dimension: usize,
    pub temperature: f32,
    pub max_output_tokens: i32,
}

impl GeminiConfig {
    /// Configuration with default endpoints and models
    pub fn new(api_key: impl Into<String>) -> Self {
        GeminiConfig {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            embedding_dimension: GEMINI_EMBEDDING_DIM,
            temperature: 0.3,
            max_output_tokens: 1500,
        }
    }

    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .or_else(|_| env::var("GOOGLE_API_KEY"))
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(RagError::MissingCredential("GEMINI_API_KEY"))?;

        let mut config = GeminiConfig::new(api_key);
        if let Ok(base_url) = env::var("GEMINI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = env::var("GEMINI_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Ok(model) = env::var("GEMINI_GENERATION_MODEL") {
            config.generation_model = model;
        }
        if let Some(temperature) = crate::env_parse("GEMINI_TEMPERATURE")? {
            config.temperature = temperature;
        }

        Ok(config)
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/{}:{}?key={}",
            self.base_url.trim_end_matches('/'),
            model,
            method,
            self.api_key
        )
    }

    fn output_dimensionality(&self) -> Option<usize> {
        (self.embedding_dimension != GEMINI_EMBEDDING_DIM).then_some(self.embedding_dimension)
    }
}

/// Client for interacting with Gemini API
#[derive(Debug, Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client
    pub fn new(config: GeminiConfig) -> Self {
        let client = reqwest::Client::new();
        GeminiClient { config, client }
    }

    /// Create a client from environment variables; fails without an API key
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(GeminiConfig::from_env()?))
    }

    /// Get the client configuration
    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// Embed a batch of documents in one request
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedRequest {
                    model: &self.config.embedding_model,
                    content: Content::new(text),
                    task_type: "RETRIEVAL_DOCUMENT",
                    output_dimensionality: self.config.output_dimensionality(),
                })
                .collect(),
        };

        let url = self
            .config
            .endpoint(&self.config.embedding_model, "batchEmbedContents");
        let response = self.client.post(&url).json(&request).send().await?;
        let response_data: BatchEmbedResponse = check_status(response).await?.json().await?;

        if response_data.embeddings.len() != texts.len() {
            return Err(RagError::Api {
                status: 200,
                message: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    response_data.embeddings.len()
                ),
            });
        }

        debug!("Embedded batch of {} documents", texts.len());
        Ok(response_data
            .embeddings
            .into_iter()
            .map(|data| Embedding {
                values: data.values,
            })
            .collect())
    }

    /// Generate the embedding for a search query
    pub async fn get_embedding(&self, text: &str) -> Result<Embedding> {
        let request = EmbedRequest {
            model: &self.config.embedding_model,
            content: Content::new(text),
            task_type: "RETRIEVAL_QUERY",
            output_dimensionality: self.config.output_dimensionality(),
        };

        let url = self
            .config
            .endpoint(&self.config.embedding_model, "embedContent");
        let response = self.client.post(&url).json(&request).send().await?;
        let response_data: EmbedResponse = check_status(response).await?.json().await?;

        Ok(Embedding {
            values: response_data.embedding.values,
        })
    }

    /// Generate text using the configured Gemini model
    pub async fn generate_text(&self, system: &str, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            system_instruction: Content::new(system),
            contents: vec![Content::new_with_role(prompt, "user")],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            },
        };

        let url = self
            .config
            .endpoint(&self.config.generation_model, "generateContent");
        let response = self.client.post(&url).json(&request).send().await?;
        let response_data: GenerateResponse = check_status(response).await?.json().await?;

        // Extract the generated text from the response
        response_data
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| RagError::Api {
                status: 200,
                message: "No response generated".to_string(),
            })
    }

    /// Generate a response based on retrieved context and question
    pub async fn generate_answer(&self, context: &str, question: &str) -> Result<String> {
        let prompt = format!(
            "CONTEXT:\n{}\n\n---\n\nQUESTION:\n{}\n\n---\n\nRESPONSE (neutral, third-person; avoid using \"I\" or \"me\"):\n",
            context, question
        );

        self.generate_text(SYSTEM_PROMPT, &prompt).await
    }
}

/// Map non-success statuses onto the error taxonomy
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(RagError::RateLimited(error_text));
    }

    Err(RagError::Api {
        status: status.as_u16(),
        message: error_text,
    })
}

// Request/response structures for the Gemini API

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model: &'a str,
    content: Content<'a>,
    task_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedRequest<'a>>,
}

#[derive(Deserialize, Debug)]
struct EmbedResponse {
    embedding: EmbeddingData,
}

#[derive(Deserialize, Debug)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    values: Vec<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
}

impl<'a> Content<'a> {
    fn new(text: &'a str) -> Self {
        Content {
            parts: vec![Part { text }],
            role: None,
        }
    }

    fn new_with_role(text: &'a str, role: &'static str) -> Self {
        Content {
            parts: vec![Part { text }],
            role: Some(role),
        }
    }
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: i32,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GeminiClient {
        let mut config = GeminiConfig::new("test-key");
        config.base_url = server.uri();
        GeminiClient::new(config)
    }

    #[tokio::test]
    async fn test_embed_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-embedding-004:batchEmbedContents"))
            .and(query_param("key", "test-key"))
            .and(body_partial_json(json!({
                "requests": [{"taskType": "RETRIEVAL_DOCUMENT"}, {"taskType": "RETRIEVAL_DOCUMENT"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [{"values": [0.1, 0.2]}, {"values": [0.3, 0.4]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let embeddings = client
            .embed_batch(&["one".to_string(), "two".to_string()])
            .await
            .unwrap();

        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[1].values, vec![0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_query_embedding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-embedding-004:embedContent"))
            .and(body_partial_json(json!({"taskType": "RETRIEVAL_QUERY"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"embedding": {"values": [1.0, 0.0, 0.5]}})),
            )
            .mount(&server)
            .await;

        let embedding = client_for(&server).get_embedding("what?").await.unwrap();
        assert_eq!(embedding.values, vec![1.0, 0.0, 0.5]);
    }

    #[tokio::test]
    async fn test_reduced_dimension_is_requested() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-embedding-004:embedContent"))
            .and(body_partial_json(json!({"outputDimensionality": 256})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": {"values": [0.5]}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut config = GeminiConfig::new("test-key");
        config.base_url = server.uri();
        config.embedding_dimension = 256;
        let embedding = GeminiClient::new(config).get_embedding("q").await.unwrap();
        assert_eq!(embedding.values, vec![0.5]);
    }

    #[tokio::test]
    async fn test_rate_limit_and_credential_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-embedding-004:embedContent"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.get_embedding("q").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::RateLimit);

        let err = client.generate_answer("ctx", "q").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Credential);
    }

    #[tokio::test]
    async fn test_generate_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(body_partial_json(json!({
                "contents": [{"role": "user"}],
                "generationConfig": {"maxOutputTokens": 1500}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "The cat sat."}]}}]
            })))
            .mount(&server)
            .await;

        let answer = client_for(&server)
            .generate_answer("--- Snippet 1 (from a.md) ---\nThe cat sat.", "Where?")
            .await
            .unwrap();
        assert_eq!(answer, "The cat sat.");
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;

        let result = client_for(&server).generate_text("system", "prompt").await;
        assert!(matches!(result, Err(RagError::Api { .. })));
    }
}
