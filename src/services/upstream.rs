//! HTTP upstream client
//!
//! reqwest-backed `UpstreamClient`. The selected credential's secret is
//! attached as a bearer token for the duration of one call only.
//!
//! Only connecting is bounded by the client itself. The forwarder bounds the
//! wait for the response head, and every body chunk must arrive within the
//! read timeout, so a long streamed completion is never cut off as a whole.

use crate::services::forwarder::{UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse};
use crate::utils::{with_timeout, TimeoutError};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use futures::stream::TryStreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Headers never copied onto the outbound request
const SKIPPED_OUTBOUND: &[&str] = &["authorization", "host", "content-length"];

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HttpUpstream {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout,
            read_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }
}

fn map_error(err: reqwest::Error, timeout: Duration) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout(timeout)
    } else if err.is_connect() {
        UpstreamError::Connect(err.to_string())
    } else if err.is_builder() {
        UpstreamError::Malformed(err.to_string())
    } else {
        UpstreamError::Transport(err.to_string())
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn send(
        &self,
        request: &UpstreamRequest,
        secret: &SecretString,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        let url = self.url_for(&request.path_and_query);

        tracing::debug!(method = %request.method, url = %url, "Calling upstream");

        let response = self
            .client
            .request(method, &url)
            .headers(outbound_headers(&request.headers))
            .bearer_auth(secret.expose_secret())
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| map_error(e, self.connect_timeout))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        let headers = inbound_headers(response.headers());

        let read_timeout = self.read_timeout;
        let mut chunks = Box::pin(response.bytes_stream());
        let body = async_stream::stream! {
            loop {
                match with_timeout(read_timeout, chunks.try_next()).await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(TimeoutError::Timeout(after)) => {
                        tracing::warn!(timeout_ms = after.as_millis() as u64, "Upstream body stalled");
                        yield Err(UpstreamError::Timeout(after));
                        break;
                    }
                    Err(TimeoutError::Inner(e)) => {
                        tracing::warn!(error = %e, "Upstream body interrupted");
                        yield Err(map_error(e, read_timeout));
                        break;
                    }
                }
            }
        };

        let mut upstream = UpstreamResponse::new(status).with_stream(Box::pin(body));
        upstream.headers = headers;
        Ok(upstream)
    }
}

/// Copy client headers onto a reqwest header map, dropping credentials
fn outbound_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if SKIPPED_OUTBOUND.contains(&name.as_str()) {
            continue;
        }
        let converted = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        );
        if let (Ok(name), Ok(value)) = converted {
            out.append(name, value);
        }
    }
    out
}

fn inbound_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let converted = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        );
        if let (Ok(name), Ok(value)) = converted {
            out.append(name, value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::classifier::ClassificationPolicy;
    use crate::services::credential_pool::{CredentialPool, PoolConfig};
    use crate::services::forwarder::{ForwarderConfig, ForwardingEngine};
    use axum::http::Method;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP/1.1 server that sends its head at once, then SSE chunks `gap` apart
    async fn sse_upstream(chunks: usize, gap: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;

            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for i in 0..chunks {
                tokio::time::sleep(gap).await;
                let data = format!("data: {i}\n\n");
                let frame = format!("{:x}\r\n{}\r\n", data.len(), data);
                if socket.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });

        format!("http://{addr}")
    }

    #[test]
    fn test_outbound_headers_drop_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer client-token"));
        headers.insert("host", HeaderValue::from_static("gateway.local"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.append("x-custom", HeaderValue::from_static("a"));
        headers.append("x-custom", HeaderValue::from_static("b"));

        let out = outbound_headers(&headers);
        assert!(out.get("authorization").is_none());
        assert!(out.get("host").is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get_all("x-custom").iter().count(), 2);
    }

    #[test]
    fn test_inbound_headers_copied() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("content-type", reqwest::header::HeaderValue::from_static("text/event-stream"));

        let out = inbound_headers(&headers);
        assert_eq!(out.get("content-type").unwrap(), "text/event-stream");
    }

    #[test]
    fn test_url_join() {
        let upstream = HttpUpstream::new(
            "https://openrouter.ai/api/",
            Duration::from_secs(10),
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(upstream.base_url(), "https://openrouter.ai/api");
        assert_eq!(
            upstream.url_for("/v1/chat/completions?stream=true"),
            "https://openrouter.ai/api/v1/chat/completions?stream=true"
        );
        assert_eq!(upstream.url_for("v1/models"), "https://openrouter.ai/api/v1/models");
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_level() {
        let upstream = HttpUpstream::new(
            "http://127.0.0.1:1",
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
        .unwrap();
        let secret = SecretString::new("sk-test".into());

        let err = upstream
            .send(&UpstreamRequest::new(Method::GET, "/v1/models"), &secret)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::Connect(_) | UpstreamError::Transport(_) | UpstreamError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn test_stream_outlasting_attempt_timeout_counts_as_success() {
        let base_url = sse_upstream(5, Duration::from_millis(400)).await;
        let upstream =
            HttpUpstream::new(base_url, Duration::from_secs(2), Duration::from_secs(1)).unwrap();

        let pool = Arc::new(CredentialPool::in_memory(PoolConfig::default()));
        let id = pool
            .register(SecretString::new("sk-or-stream-test-000001".into()))
            .await
            .unwrap();
        let config = ForwarderConfig {
            attempt_timeout: Duration::from_secs(1),
            ..ForwarderConfig::default()
        };
        let engine = ForwardingEngine::new(
            pool.clone(),
            Arc::new(upstream),
            ClassificationPolicy::default(),
            config,
        );

        let response = engine
            .forward(UpstreamRequest::new(Method::POST, "/v1/chat/completions").with_body("{}"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/event-stream");

        let body = response.body.into_bytes().await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text, "data: 0\n\ndata: 1\n\ndata: 2\n\ndata: 3\n\ndata: 4\n\n");

        let snapshot = pool.snapshot(&id).unwrap();
        assert!(snapshot.last_success_at.is_some());
        assert!(snapshot.last_failure_at.is_none());
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_stalled_body_hits_read_timeout() {
        let base_url = sse_upstream(2, Duration::from_millis(500)).await;
        let upstream =
            HttpUpstream::new(base_url, Duration::from_secs(2), Duration::from_millis(100)).unwrap();
        let secret = SecretString::new("sk-test".into());

        let response = upstream
            .send(&UpstreamRequest::new(Method::GET, "/v1/models"), &secret)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let err = response.body.into_bytes().await.unwrap_err();
        assert_eq!(err, UpstreamError::Timeout(Duration::from_millis(100)));
    }
}
