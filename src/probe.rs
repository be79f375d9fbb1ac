use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant};

use crate::config::{Config, DEFAULT_TARGET_URL, DEFAULT_TIMEOUT_MS};
use crate::error::ProbeError;
use crate::types::{Candidate, FailureReason, ProbeOutcome};

const METADATA_MAX_CHARS: usize = 256;
/// Enough raw bytes for the metadata snippet even if every char is 4-byte UTF-8.
const BODY_READ_LIMIT: usize = METADATA_MAX_CHARS * 4;

/// Immutable per-attempt probe parameters. Cloned into every task, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub target_url: String,
    pub timeout: Duration,
    /// Treat non-2xx answers as failures. Off by default: any response
    /// received without a transport error verifies the candidate.
    pub strict_status: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            target_url: DEFAULT_TARGET_URL.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            strict_status: false,
        }
    }
}

impl From<&Config> for ProbeSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            target_url: cfg.target_url.clone(),
            timeout: cfg.timeout(),
            strict_status: cfg.strict_status,
        }
    }
}

/// Verifies a single candidate. Implementations must be safe to call from
/// any number of tasks at once.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, candidate: &Candidate, settings: &ProbeSettings) -> ProbeOutcome;
}

/// Sends one GET to the target URL through the candidate acting as proxy.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProber;

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, candidate: &Candidate, settings: &ProbeSettings) -> ProbeOutcome {
        probe_candidate(candidate, settings).await
    }
}

/// Probe `candidate` once, bounded by `settings.timeout` end to end.
pub async fn probe_candidate(candidate: &Candidate, settings: &ProbeSettings) -> ProbeOutcome {
    let start = Instant::now();
    let res = match time::timeout(settings.timeout, fetch_through(candidate, settings)).await {
        Ok(res) => res,
        Err(_) => Err(ProbeError::Timeout {
            proxy: candidate.proxy_url(),
        }),
    };
    let latency_ms = start.elapsed().as_millis() as u64;

    match res {
        Ok((status, body)) => {
            let metadata = summarize_body(&body);
            if settings.strict_status && !(200..300).contains(&status) {
                ProbeOutcome::failed(
                    candidate.clone(),
                    FailureReason::NonSuccessStatus,
                    Some(format!("status {status}")),
                    latency_ms,
                )
            } else {
                ProbeOutcome::verified(candidate.clone(), status, metadata, latency_ms)
            }
        }
        Err(e) => {
            let reason = match e {
                ProbeError::Timeout { .. } => FailureReason::Timeout,
                _ => FailureReason::ConnectFailed,
            };
            ProbeOutcome::failed(candidate.clone(), reason, Some(e.to_string()), latency_ms)
        }
    }
}

async fn fetch_through(candidate: &Candidate, settings: &ProbeSettings) -> Result<(u16, Vec<u8>), ProbeError> {
    let proxy_url = candidate.proxy_url();
    let proxy = reqwest::Proxy::all(&proxy_url).map_err(|source| ProbeError::InvalidProxy {
        proxy: proxy_url.clone(),
        source,
    })?;
    // Fresh client per attempt: proxy and timeout are per-candidate configuration.
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(settings.timeout)
        .build()
        .map_err(ProbeError::Client)?;

    let mut resp = client
        .get(&settings.target_url)
        .send()
        .await
        .map_err(|e| classify(&proxy_url, e))?;
    let status = resp.status().as_u16();

    // Only the head of the body is kept; the rest is never pulled off the wire.
    let mut body = Vec::new();
    while body.len() < BODY_READ_LIMIT {
        match resp.chunk().await.map_err(|e| classify(&proxy_url, e))? {
            Some(chunk) => body.extend_from_slice(&chunk),
            None => break,
        }
    }
    body.truncate(BODY_READ_LIMIT);
    Ok((status, body))
}

fn classify(proxy: &str, e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout {
            proxy: proxy.to_string(),
        }
    } else {
        ProbeError::Transport {
            proxy: proxy.to_string(),
            source: e,
        }
    }
}

/// First few hundred characters of the body on a single line.
fn summarize_body(body: &[u8]) -> Option<String> {
    let s = String::from_utf8_lossy(body);
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let snippet: String = s.chars().take(METADATA_MAX_CHARS).collect();
    Some(snippet.replace('\n', "\\n").replace('\r', "\\r"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProtocolClass;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal forward proxy: answers every request with `status` and a fixed body.
    async fn spawn_stub_proxy(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(answer(stream, status));
            }
        });
        addr.to_string()
    }

    async fn answer(mut stream: TcpStream, status: u16) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let body = "203.0.113.7\n";
        let resp = format!(
            "HTTP/1.1 {status} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(resp.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    /// Claims a 1 GiB body and keeps streaming until the client hangs up.
    async fn spawn_endless_body_proxy() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut chunk = [0u8; 1024];
                    if stream.read(&mut chunk).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let head = "HTTP/1.1 200 OK\r\nContent-Length: 1073741824\r\n\r\n";
                    if stream.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    let block = vec![b'y'; 64 * 1024];
                    while stream.write_all(&block).await.is_ok() {}
                });
            }
        });
        addr.to_string()
    }

    /// Accepts connections and never answers.
    async fn spawn_silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr.to_string()
    }

    fn settings(timeout_ms: u64) -> ProbeSettings {
        ProbeSettings {
            target_url: "http://probe.test/ip".into(),
            timeout: Duration::from_millis(timeout_ms),
            strict_status: false,
        }
    }

    #[tokio::test]
    async fn working_proxy_is_verified_with_metadata() {
        let addr = spawn_stub_proxy(200).await;
        let c = Candidate::new(&addr, ProtocolClass::Http).unwrap();
        let out = probe_candidate(&c, &settings(2_000)).await;
        assert!(out.success, "{out:?}");
        assert_eq!(out.status, Some(200));
        assert_eq!(out.response_metadata.as_deref(), Some("203.0.113.7"));
        assert!(out.failure_reason.is_none());
    }

    #[tokio::test]
    async fn any_status_counts_unless_strict() {
        let addr = spawn_stub_proxy(503).await;
        let c = Candidate::new(&addr, ProtocolClass::Http).unwrap();

        let lenient = probe_candidate(&c, &settings(2_000)).await;
        assert!(lenient.success);
        assert_eq!(lenient.status, Some(503));

        let strict = ProbeSettings {
            strict_status: true,
            ..settings(2_000)
        };
        let out = probe_candidate(&c, &strict).await;
        assert!(!out.success);
        assert_eq!(out.failure_reason, Some(FailureReason::NonSuccessStatus));
    }

    #[tokio::test]
    async fn refused_connection_is_connect_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let c = Candidate::new(&addr, ProtocolClass::Http).unwrap();
        let out = probe_candidate(&c, &settings(2_000)).await;
        assert!(!out.success);
        assert_eq!(out.failure_reason, Some(FailureReason::ConnectFailed));
    }

    #[tokio::test]
    async fn silent_proxy_times_out_promptly() {
        let addr = spawn_silent_server().await;
        let c = Candidate::new(&addr, ProtocolClass::Http).unwrap();
        let start = std::time::Instant::now();
        let out = probe_candidate(&c, &settings(200)).await;
        let elapsed = start.elapsed();
        assert!(!out.success);
        assert_eq!(out.failure_reason, Some(FailureReason::Timeout));
        assert!(elapsed >= Duration::from_millis(190), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(250), "{elapsed:?}");
    }

    #[tokio::test]
    async fn oversized_body_is_cut_short() {
        let addr = spawn_endless_body_proxy().await;
        let c = Candidate::new(&addr, ProtocolClass::Http).unwrap();
        let start = std::time::Instant::now();
        let out = probe_candidate(&c, &settings(5_000)).await;
        let elapsed = start.elapsed();
        assert!(out.success, "{out:?}");
        let meta = out.response_metadata.unwrap();
        assert_eq!(meta.len(), METADATA_MAX_CHARS);
        assert!(meta.chars().all(|ch| ch == 'y'));
        // Returns as soon as the head is read, long before the timeout.
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    #[test]
    fn body_summary_is_single_line_and_bounded() {
        assert_eq!(summarize_body(b"  \n"), None);
        assert_eq!(summarize_body(b"a\r\nb\n").as_deref(), Some("a\\r\\nb"));
        let long = vec![b'x'; 1000];
        assert_eq!(summarize_body(&long).unwrap().len(), METADATA_MAX_CHARS);
    }
}
