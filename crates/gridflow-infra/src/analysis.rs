//! HTTP analysis service client.
//!
//! Talks JSON to an analysis backend:
//!
//! - `POST {endpoint}/v1/analyses/lookup` with `{"key": ...}` returns a stored
//!   result (200) or nothing (404).
//! - `POST {endpoint}/v1/analyses` with the full request runs a new analysis.
//!
//! Requests rotate through the configured API keys; the key count is the
//! concurrency hint the engine sizes its worker pool by. Timeouts, connection
//! failures, 429 and 5xx are transient; other 4xx and undecodable bodies are
//! fatal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gridflow_core::provider::analysis::{
    AnalysisError, AnalysisKey, AnalysisRequest, AnalysisService, DEFAULT_CONCURRENCY,
};
use gridflow_types::config::AnalysisConfig;
use gridflow_types::payload::AnalysisResult;
use reqwest::StatusCode;
use serde::Serialize;

/// `AnalysisService` over HTTP.
pub struct HttpAnalysisService {
    client: reqwest::Client,
    endpoint: String,
    api_keys: Vec<String>,
    next_key: AtomicUsize,
}

#[derive(Serialize)]
struct LookupBody<'a> {
    key: &'a AnalysisKey,
}

impl HttpAnalysisService {
    pub fn new(config: &AnalysisConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_keys: config.api_keys.clone(),
            next_key: AtomicUsize::new(0),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.url(path));
        if self.api_keys.is_empty() {
            return builder;
        }
        let index = self.next_key.fetch_add(1, Ordering::Relaxed) % self.api_keys.len();
        builder.bearer_auth(&self.api_keys[index])
    }
}

fn send_error(e: reqwest::Error) -> AnalysisError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        AnalysisError::Transient(format!("HTTP request failed: {e}"))
    } else {
        AnalysisError::Fatal(format!("HTTP request failed: {e}"))
    }
}

/// Map a non-success status to the retry class.
fn status_error(status: StatusCode, body: &str) -> AnalysisError {
    let message = format!("HTTP {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        AnalysisError::Transient(message)
    } else {
        AnalysisError::Fatal(message)
    }
}

async fn decode(response: reqwest::Response) -> Result<AnalysisResult, AnalysisError> {
    response
        .json::<AnalysisResult>()
        .await
        .map_err(|e| AnalysisError::Fatal(format!("failed to parse analysis result: {e}")))
}

impl AnalysisService for HttpAnalysisService {
    async fn find_existing(&self, key: &AnalysisKey) -> Result<Option<AnalysisResult>, AnalysisError> {
        let response = self
            .post("/v1/analyses/lookup")
            .json(&LookupBody { key })
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        decode(response).await.map(Some)
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        let response = self
            .post("/v1/analyses")
            .json(request)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(
                entity = %request.key.entity,
                period = %request.key.period,
                status = status.as_u16(),
                "analysis request rejected"
            );
            return Err(status_error(status, &body));
        }
        decode(response).await
    }

    fn concurrency_hint(&self) -> usize {
        if self.api_keys.is_empty() {
            DEFAULT_CONCURRENCY
        } else {
            self.api_keys.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::provider::analysis::AnalysisInput;
    use gridflow_types::period::Period;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request
        });
        (format!("http://{addr}"), handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= split + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn service(endpoint: &str, keys: &[&str]) -> HttpAnalysisService {
        let config = AnalysisConfig {
            endpoint: endpoint.to_string(),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
        };
        HttpAnalysisService::new(&config, Duration::from_secs(5))
    }

    fn key() -> AnalysisKey {
        AnalysisKey {
            entity: "ACME".into(),
            period: Period::Year(2024),
            analysis_kind: "health".into(),
            document_kind: Some("annual_report".into()),
            variant: None,
            params: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!status_error(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad input").is_transient());
    }

    #[test]
    fn test_concurrency_hint_follows_key_count() {
        assert_eq!(service("http://localhost", &[]).concurrency_hint(), DEFAULT_CONCURRENCY);
        assert_eq!(service("http://localhost", &["a", "b", "c"]).concurrency_hint(), 3);
    }

    #[tokio::test]
    async fn test_find_existing_decodes_hit() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"result_type":"financial_health","run_id":"inv-1","data":{"score":7}}"#,
        )
        .await;
        let svc = service(&url, &["secret-key"]);

        let found = svc.find_existing(&key()).await.unwrap().unwrap();
        assert_eq!(found.run_id, "inv-1");
        assert_eq!(found.data["score"], 7);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/analyses/lookup"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-key"));
        assert!(request.contains("\"entity\":\"ACME\""));
    }

    #[tokio::test]
    async fn test_find_existing_miss_is_none() {
        let (url, server) = serve_once("404 Not Found", "").await;
        let svc = service(&url, &[]);
        assert!(svc.find_existing(&key()).await.unwrap().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_analyze_maps_rate_limit_to_transient() {
        let (url, server) = serve_once("429 Too Many Requests", r#"{"error":"slow down"}"#).await;
        let svc = service(&url, &[]);
        let request = AnalysisRequest {
            key: key(),
            input: AnalysisInput::Prompt { text: "hello".into() },
        };

        let err = svc.analyze(&request).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("429"));
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /v1/analyses "));
        assert!(raw.contains("\"type\":\"prompt\""));
    }

    #[tokio::test]
    async fn test_analyze_bad_body_is_fatal() {
        let (url, server) = serve_once("200 OK", "not json").await;
        let svc = service(&url, &[]);
        let request = AnalysisRequest {
            key: key(),
            input: AnalysisInput::Prompt { text: "hello".into() },
        };

        let err = svc.analyze(&request).await.unwrap_err();
        assert!(!err.is_transient());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let svc = service(&format!("http://{addr}"), &[]);
        let err = svc.find_existing(&key()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
