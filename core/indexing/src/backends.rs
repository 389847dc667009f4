/// Embedding backends: request/reply over the message bus, or direct HTTP to
/// the model server.
use async_trait::async_trait;
use futures::future::try_join_all;
use memory_graph_schemas::{
    generate_request_id, subjects, EmbeddingReply, EmbeddingRequest, ModelServerRequest,
    ModelServerResponse,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::embedding::{EmbeddingBackend, EmbeddingError};
use crate::messaging::{BusError, MessageBus};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishes `{id, text, request_id}` on the request subject and waits for a
/// correlated `{embedding, error?}` reply.
pub struct BusEmbeddingBackend {
    bus: Option<Arc<dyn MessageBus>>,
    subject: String,
    timeout: Duration,
}

impl BusEmbeddingBackend {
    pub fn new(bus: Option<Arc<dyn MessageBus>>) -> Self {
        Self {
            bus,
            subject: subjects::EMBEDDING_REQUEST.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request_one(
        &self,
        bus: &dyn MessageBus,
        id: String,
        text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let request = EmbeddingRequest {
            id,
            text: text.to_string(),
            request_id: generate_request_id(),
        };
        let request_id = request.request_id.0.clone();
        let payload = serde_json::to_vec(&request)
            .map_err(|e| EmbeddingError::Transport(format!("failed to encode request: {}", e)))?;

        let raw = bus
            .request(&self.subject, payload, self.timeout)
            .await
            .map_err(|e| match e {
                BusError::Timeout { timeout, .. } => EmbeddingError::Timeout {
                    request_id: request_id.clone(),
                    timeout,
                },
                other => EmbeddingError::Transport(other.to_string()),
            })?;

        decode_reply(&raw)
    }
}

fn decode_reply(raw: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
    let reply: EmbeddingReply = serde_json::from_slice(raw)
        .map_err(|e| EmbeddingError::MalformedReply(e.to_string()))?;

    if let Some(error) = reply.error {
        return Err(EmbeddingError::Remote(error));
    }
    if reply.embedding.is_empty() {
        return Err(EmbeddingError::MalformedReply(
            "reply carried neither embedding nor error".into(),
        ));
    }

    Ok(reply.embedding)
}

#[async_trait]
impl EmbeddingBackend for BusEmbeddingBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let bus = self.bus.as_deref().ok_or(EmbeddingError::NotConfigured)?;
        let batch = generate_request_id();
        debug!("Requesting {} embeddings on {}", texts.len(), self.subject);

        try_join_all(
            texts
                .iter()
                .enumerate()
                .map(|(idx, text)| self.request_one(bus, format!("{}-{}", batch, idx), text)),
        )
        .await
    }

    async fn health_check(&self) -> bool {
        let Some(bus) = self.bus.as_deref() else {
            warn!("Embedding health check failed: no messaging connection configured");
            return false;
        };
        match self
            .request_one(bus, "health-check".to_string(), "health check")
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Embedding health check failed: {}", e);
                false
            }
        }
    }
}

/// HTTP client for the embedding model server: `{input, model}` -> `{vector}`.
pub struct ModelServerClient {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl ModelServerClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = ModelServerRequest {
            input: text.to_string(),
            model: self.model.clone(),
        };

        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Remote(format!(
                "model server returned {}: {}",
                status, error_text
            )));
        }

        let parsed: ModelServerResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::MalformedReply(e.to_string()))?;

        if parsed.vector.is_empty() {
            return Err(EmbeddingError::MalformedReply("empty vector".into()));
        }

        Ok(parsed.vector)
    }

    fn classify(&self, err: reqwest::Error) -> EmbeddingError {
        if err.is_timeout() {
            EmbeddingError::Timeout {
                request_id: format!("{}/embed", self.base_url),
                timeout: self.timeout,
            }
        } else {
            EmbeddingError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl EmbeddingBackend for ModelServerClient {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        try_join_all(texts.iter().map(|text| self.embed_one(text))).await
    }

    async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("Model server health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InProcessBus;

    #[test]
    fn test_decode_reply() {
        assert_eq!(
            decode_reply(br#"{"embedding":[1.0,2.0]}"#).unwrap(),
            vec![1.0, 2.0]
        );
        assert!(matches!(
            decode_reply(br#"{"embedding":[],"error":"overloaded"}"#),
            Err(EmbeddingError::Remote(msg)) if msg == "overloaded"
        ));
        assert!(matches!(
            decode_reply(b"not json"),
            Err(EmbeddingError::MalformedReply(_))
        ));
        assert!(matches!(
            decode_reply(b"{}"),
            Err(EmbeddingError::MalformedReply(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_bus_is_configuration_error() {
        let backend = BusEmbeddingBackend::new(None);
        let err = backend.embed_texts(&["hello".into()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::NotConfigured));
        assert!(!backend.health_check().await);
    }

    #[tokio::test]
    async fn test_round_trip_over_bus() {
        let bus = Arc::new(InProcessBus::new());
        let mut rx = bus.subscribe(subjects::EMBEDDING_REQUEST);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let request: EmbeddingRequest = serde_json::from_slice(&msg.payload).unwrap();
                let reply = EmbeddingReply {
                    embedding: vec![request.text.len() as f32, 1.0],
                    error: None,
                };
                msg.respond(serde_json::to_vec(&reply).unwrap()).unwrap();
            }
        });

        let backend = BusEmbeddingBackend::new(Some(bus as Arc<dyn MessageBus>));
        let vectors = backend
            .embed_texts(&["a".into(), "abcd".into()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![4.0, 1.0]]);
        assert!(backend.health_check().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let bus = Arc::new(InProcessBus::new());
        let _rx = bus.subscribe(subjects::EMBEDDING_REQUEST);

        let backend = BusEmbeddingBackend::new(Some(bus as Arc<dyn MessageBus>))
            .with_timeout(Duration::from_secs(30));
        let err = backend.embed_texts(&["x".into()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Timeout { timeout, .. } if timeout == Duration::from_secs(30)));
    }

    #[test]
    fn test_model_server_client_trims_base_url() {
        let client = ModelServerClient::new("http://localhost:8080/", "all-minilm");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.model(), "all-minilm");
    }
}
