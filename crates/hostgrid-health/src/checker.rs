//! Health check probes.
//!
//! A [`HealthVerifier`] turns a probe URL into a [`ProbeObservation`]. It
//! never fails: an unreachable endpoint is an unhealthy observation with
//! no latency.

use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::Empty;
use hostgrid_state::ProbeObservation;
use tracing::debug;

#[async_trait]
pub trait HealthVerifier: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeObservation;
}

/// Probe that issues a plain HTTP/1.1 `GET` and expects a 2xx.
pub struct HttpVerifier {
    timeout: Duration,
}

impl HttpVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthVerifier for HttpVerifier {
    async fn probe(&self, url: &str) -> ProbeObservation {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, get(url)).await;
        let latency_ms = Some(started.elapsed().as_millis() as u64);

        match outcome {
            Ok(Ok(status)) if status.is_success() => ProbeObservation {
                healthy: true,
                latency_ms,
                error: None,
            },
            Ok(Ok(status)) => {
                debug!(%url, %status, "health probe non-2xx");
                ProbeObservation {
                    healthy: false,
                    latency_ms,
                    error: Some(format!("unexpected status {status}")),
                }
            }
            Ok(Err(e)) => {
                debug!(%url, error = %format!("{e:#}"), "health probe failed");
                no_response(format!("{e:#}"))
            }
            Err(_) => {
                debug!(%url, "health probe timed out");
                no_response(format!("timed out after {}ms", self.timeout.as_millis()))
            }
        }
    }
}

fn no_response(error: String) -> ProbeObservation {
    ProbeObservation {
        healthy: false,
        latency_ms: None,
        error: Some(error),
    }
}

async fn get(url: &str) -> anyhow::Result<StatusCode> {
    let uri: Uri = url
        .parse()
        .with_context(|| format!("invalid probe url '{url}'"))?;
    if uri.scheme_str() != Some("http") {
        bail!("unsupported scheme in probe url '{url}'");
    }
    let host = uri.host().context("probe url has no host")?;
    let port = uri.port_u16().unwrap_or(80);
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or(host);

    let stream = tokio::net::TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect to {authority} failed"))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("handshake failed")?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "probe connection closed");
        }
    });

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let req = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, authority)
        .header(USER_AGENT, "hostgrid-health/0.1")
        .body(Empty::<Bytes>::new())?;

    let resp = sender.send_request(req).await.context("request failed")?;
    Ok(resp.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response to every connection.
    async fn serve(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn two_hundred_is_healthy() {
        let url = serve("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        let obs = HttpVerifier::new(Duration::from_secs(2)).probe(&url).await;
        assert!(obs.healthy);
        assert!(obs.latency_ms.is_some());
        assert_eq!(obs.error, None);
    }

    #[tokio::test]
    async fn non_2xx_is_unhealthy_with_latency() {
        let url = serve("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n").await;
        let obs = HttpVerifier::new(Duration::from_secs(2)).probe(&url).await;
        assert!(!obs.healthy);
        assert!(obs.latency_ms.is_some());
        assert!(obs.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let obs = HttpVerifier::new(Duration::from_millis(500))
            .probe("http://127.0.0.1:1/health")
            .await;
        assert!(!obs.healthy);
        assert_eq!(obs.latency_ms, None);
        assert!(obs.error.is_some());
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let obs = HttpVerifier::new(Duration::from_millis(100))
            .probe(&format!("http://{addr}/health"))
            .await;
        assert!(!obs.healthy);
        assert_eq!(obs.latency_ms, None);
        assert!(obs.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn bad_urls_are_unhealthy() {
        let verifier = HttpVerifier::new(Duration::from_millis(100));
        for url in ["not a url", "https://example.test/health", "/health"] {
            let obs = verifier.probe(url).await;
            assert!(!obs.healthy, "{url}");
            assert!(obs.error.is_some(), "{url}");
        }
    }
}
