//! Pre-flight reachability check of the upstream host.
//!
//! A single GET with a bounded timeout. Any HTTP response counts as
//! reachable, whatever its status; only transport failures fail the probe.

use crate::error::ProbeError;
use std::error::Error as StdError;
use std::io;
use std::time::{Duration, Instant};

/// Outcome of one probe.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub latency: Duration,
    /// HTTP status on success, classified failure otherwise
    pub outcome: Result<u16, ProbeError>,
}

impl ProbeReport {
    pub fn detail(&self) -> String {
        match &self.outcome {
            Ok(status) => format!("HTTP {} in {}ms", status, self.latency.as_millis()),
            Err(err) => err.to_string(),
        }
    }
}

/// Reusable probe client. Connections are never pooled so each probe
/// opens a fresh TCP/TLS connection.
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
    url: String,
}

impl Prober {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn probe(&self) -> ProbeReport {
        let start = Instant::now();
        let outcome = match self.client.get(&self.url).send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(err) => Err(classify(&err)),
        };
        ProbeReport {
            latency: start.elapsed(),
            outcome,
        }
    }
}

/// Map a reqwest failure onto the probe taxonomy by inspecting its source chain.
fn classify(err: &reqwest::Error) -> ProbeError {
    let detail = describe_chain(err);
    if err.is_timeout() {
        return ProbeError::Timeout(detail);
    }

    let mut source = Some(err as &(dyn StdError + 'static));
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return ProbeError::Refused(detail),
                io::ErrorKind::TimedOut => return ProbeError::Timeout(detail),
                _ => {}
            }
        }
        source = current.source();
    }

    let lower = detail.to_lowercase();
    if lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
    {
        ProbeError::Dns(detail)
    } else if lower.contains("connection refused") {
        ProbeError::Refused(detail)
    } else {
        ProbeError::Other(detail)
    }
}

/// "outer: inner: innermost", skipping messages repeated by wrappers.
fn describe_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut source = Some(err);
    while let Some(current) = source {
        let message = current.to_string();
        if !parts.iter().any(|p| p.contains(&message)) {
            parts.push(message);
        }
        source = current.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_any_http_status_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let prober = Prober::new(format!("http://{}/", addr), Duration::from_secs(5)).unwrap();
        let report = prober.probe().await;
        assert!(report.outcome.is_ok(), "{:?}", report);
        assert_eq!(report.outcome, Ok(503));
        assert!(report.detail().contains("503"));
    }

    #[tokio::test]
    async fn test_refused_connection_classified() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let prober = Prober::new(format!("http://127.0.0.1:{}/", port), Duration::from_secs(5)).unwrap();
        let report = prober.probe().await;
        assert!(report.outcome.is_err());
        assert!(matches!(report.outcome, Err(ProbeError::Refused(_))), "{:?}", report);
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the socket without ever answering
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let prober = Prober::new(format!("http://{}/", addr), Duration::from_millis(200)).unwrap();
        let report = prober.probe().await;
        assert!(matches!(report.outcome, Err(ProbeError::Timeout(_))), "{:?}", report);
        assert!(report.latency < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unknown_host_is_dns_failure() {
        let prober = Prober::new("http://stt-relay-probe.invalid/", Duration::from_secs(5)).unwrap();
        let report = prober.probe().await;
        assert!(matches!(report.outcome, Err(ProbeError::Dns(_))), "{:?}", report);
    }
}
