//! Plain HTTP GETs against an admin API reached through a tunnel

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use adminscope_types::{Error, Result};

/// Longest response body kept in a BadStatus error
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Unauthenticated admin API client; it never retries
#[derive(Clone, Debug)]
pub struct AdminClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl AdminClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Loopback tunnels only: no environment proxies, no connections kept across sessions
        let http = reqwest::Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, timeout })
    }

    /// GET `http://{address}{path}[?{query}]` and return the raw body
    pub async fn fetch(
        &self,
        address: &str,
        path: &str,
        query: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let url = match query {
            Some(q) if !q.is_empty() => format!("http://{}{}?{}", address, path, q),
            _ => format!("http://{}{}", address, path),
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.get(&url, address, path) => result,
        }
    }

    async fn get(&self, url: &str, address: &str, path: &str) -> Result<Bytes> {
        tracing::debug!(%url, "admin request");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e, address, path))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify(e, address, path))?;

        if !status.is_success() {
            return Err(Error::BadStatus {
                path: path.to_string(),
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        Ok(body)
    }

    fn classify(&self, e: reqwest::Error, address: &str, path: &str) -> Error {
        if e.is_timeout() {
            Error::Timeout(format!("{} on {} after {:?}", path, address, self.timeout))
        } else {
            Error::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> AdminClient {
        AdminClient::new(Duration::from_secs(5)).unwrap()
    }

    fn address(server: &MockServer) -> String {
        server.address().to_string()
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config_dump"))
            .and(query_param("include_eds", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"configs":[]}"#))
            .mount(&server)
            .await;

        let body = client()
            .fetch(
                &address(&server),
                "/config_dump",
                Some("include_eds"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"configs":[]}"#);
    }

    #[tokio::test]
    async fn test_non_success_is_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stats"))
            .respond_with(ResponseTemplate::new(503).set_body_string("x".repeat(500)))
            .mount(&server)
            .await;

        let err = client()
            .fetch(&address(&server), "/stats", None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::BadStatus { path, status, body } => {
                assert_eq!(path, "/stats");
                assert_eq!(status, 503);
                assert_eq!(body.chars().count(), MAX_ERROR_BODY_CHARS + 3);
                assert!(body.ends_with("..."));
            }
            other => panic!("expected BadStatus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client()
            .fetch(&addr, "/stats", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable { address, .. } if address == addr));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = AdminClient::new(Duration::from_millis(100)).unwrap();
        let err = client
            .fetch(&address(&server), "/clusters", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancelled_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client()
            .fetch(&address(&server), "/clusters", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(300);
        let truncated = truncate_body(body.as_bytes());
        assert!(truncated.starts_with("éé"));
        assert_eq!(truncated.chars().count(), MAX_ERROR_BODY_CHARS + 3);

        assert_eq!(truncate_body(b"  short  "), "short");
    }
}
