//! Streaming inference client
//!
//! Issues generation requests to the inference server and exposes the
//! response body as a stream of event payloads.

use crate::sse::{self, EventStream};
use async_trait::async_trait;
use chatrelay_common::config::InferenceConfig;
use chatrelay_common::{ChatRelayError, Result, METRICS};
use chatrelay_proto::GenerateRequest;
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

/// Source of generation event streams
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Start a streaming generation
    ///
    /// Resolves once the response head is in; a non-success status is
    /// returned as [`ChatRelayError::InferenceStatus`].
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<EventStream>;
}

/// HTTP client for a `/generate_stream` endpoint
pub struct InferenceClient {
    http: reqwest::Client,
    endpoint: String,
}

impl InferenceClient {
    /// Create a new inference client
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            http,
            endpoint: config.generate_stream_endpoint(),
        })
    }
}

#[async_trait]
impl InferenceBackend for InferenceClient {
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<EventStream> {
        METRICS.inference.requests_total.inc();
        debug!(
            endpoint = %self.endpoint,
            prompt_len = request.inputs.len(),
            "Requesting generation stream"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                METRICS.inference.request_errors.inc();
                ChatRelayError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            METRICS.inference.request_errors.inc();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Inference server rejected generation request");
            return Err(ChatRelayError::InferenceStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(sse::data_events(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_proto::GenerationParameters;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + content_length {
                    return text;
                }
            }
        }

        String::from_utf8_lossy(&buf).to_string()
    }

    /// Answer one request with a raw status line and body, then close
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{}",
                status, body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });

        (format!("http://{}", addr), handle)
    }

    fn client_for(url: String) -> InferenceClient {
        InferenceClient::new(&InferenceConfig {
            url,
            connect_timeout_secs: 2,
        })
        .unwrap()
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            inputs: "prompt".to_string(),
            parameters: GenerationParameters::default(),
        }
    }

    #[tokio::test]
    async fn test_streams_event_payloads() {
        let (url, server) = serve_once(
            "200 OK",
            "data: {\"token\":{\"id\":1,\"text\":\"Hi\",\"logprob\":-0.1}}\n\n\
             data: {\"generated_text\":\"Hi\"}\n\n",
        )
        .await;
        let client = client_for(url);

        let events = client.generate_stream(&request()).await.unwrap();
        let payloads: Vec<String> = events.map(|e| e.unwrap()).collect().await;

        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].contains("\"text\":\"Hi\""));
        assert_eq!(payloads[1], r#"{"generated_text":"Hi"}"#);

        let raw_request = server.await.unwrap();
        assert!(raw_request.starts_with("POST /generate_stream"));
        assert!(raw_request
            .to_lowercase()
            .contains("accept: text/event-stream"));
        assert!(raw_request.contains("\"inputs\":\"prompt\""));
        assert!(raw_request.contains("\"max_new_tokens\":100"));
    }

    #[tokio::test]
    async fn test_error_status() {
        let (url, _server) = serve_once("503 Service Unavailable", "model overloaded").await;
        let client = client_for(url);

        let result = client.generate_stream(&request()).await;

        match result {
            Err(ChatRelayError::InferenceStatus { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "model overloaded");
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("expected an error status"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(format!("http://{}", addr));
        let result = client.generate_stream(&request()).await;

        assert!(matches!(result, Err(ChatRelayError::Http(_))));
    }
}
