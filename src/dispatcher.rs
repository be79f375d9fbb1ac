use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, DEFAULT_CONCURRENCY, MAX_CONCURRENCY};
use crate::probe::{ProbeSettings, Prober};
use crate::sink::ResultSink;
use crate::types::{BatchSummary, Candidate, FailureReason};

/// How a batch is probed: per-attempt settings plus the concurrency ceiling.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub settings: ProbeSettings,
    pub concurrency: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            settings: ProbeSettings::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl From<&Config> for DispatchOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            settings: ProbeSettings::from(cfg),
            concurrency: cfg.effective_concurrency(),
        }
    }
}

/// Live counters for one batch, readable while the batch is running.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub total: Arc<AtomicU64>,
    pub attempted: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub timed_out: Arc<AtomicU64>,
    pub cancelled: Arc<AtomicU64>,
    pub write_errors: Arc<AtomicU64>,
    pub verified: Arc<Mutex<Vec<String>>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            total: Arc::new(AtomicU64::new(0)),
            attempted: Arc::new(AtomicU64::new(0)),
            succeeded: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            timed_out: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicU64::new(0)),
            write_errors: Arc::new(AtomicU64::new(0)),
            verified: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attempts that reached a conclusion so far.
    pub fn done(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.timed_out.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> BatchSummary {
        BatchSummary {
            total: self.total.load(Ordering::Relaxed),
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            verified: self.verified.lock().await.clone(),
        }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe every candidate once and hand each verified address to `sink`.
///
/// - At most `opts.concurrency` attempts are in flight (a `Semaphore` gates spawning).
/// - Each attempt runs in its own task with its own copy of the probe settings.
/// - Returns only after every spawned attempt has finished and its success,
///   if any, has been recorded.
pub async fn dispatch_all(
    candidates: Vec<Candidate>,
    opts: &DispatchOptions,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn ResultSink>,
) -> BatchSummary {
    dispatch_internal(candidates, opts, prober, sink, None, None).await
}

/// Variant that accepts a `CancellationToken` to allow external cancellation.
pub async fn dispatch_all_with_cancel(
    candidates: Vec<Candidate>,
    opts: &DispatchOptions,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn ResultSink>,
    cancel: CancellationToken,
) -> BatchSummary {
    dispatch_internal(candidates, opts, prober, sink, Some(cancel), None).await
}

/// Variant that publishes live counters through `shared`.
pub async fn dispatch_all_with_shared(
    candidates: Vec<Candidate>,
    opts: &DispatchOptions,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn ResultSink>,
    cancel: CancellationToken,
    shared: SharedProgress,
) -> BatchSummary {
    dispatch_internal(candidates, opts, prober, sink, Some(cancel), Some(shared)).await
}

async fn dispatch_internal(
    candidates: Vec<Candidate>,
    opts: &DispatchOptions,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn ResultSink>,
    cancel_opt: Option<CancellationToken>,
    shared_opt: Option<SharedProgress>,
) -> BatchSummary {
    let progress = shared_opt.unwrap_or_default();
    let cancel = cancel_opt.unwrap_or_default();
    progress
        .total
        .fetch_add(candidates.len() as u64, Ordering::Relaxed);

    let sem = Arc::new(Semaphore::new(opts.concurrency.clamp(1, MAX_CONCURRENCY)));
    let mut set = JoinSet::new();
    let mut pending = candidates.into_iter();

    while let Some(candidate) = pending.next() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            p = sem.clone().acquire_owned() => p.ok(),
        };
        let Some(permit) = permit else {
            // Never started: this one plus everything still queued.
            progress
                .cancelled
                .fetch_add(1 + pending.len() as u64, Ordering::Relaxed);
            break;
        };

        let settings = opts.settings.clone();
        let prober = prober.clone();
        let sink = sink.clone();
        let progress = progress.clone();
        let cancel = cancel.clone();
        progress.attempted.fetch_add(1, Ordering::Relaxed);

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                out = prober.probe(&candidate, &settings) => Some(out),
            };
            let Some(outcome) = outcome else {
                progress.cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            };

            if outcome.success {
                info!(
                    proxy = %candidate,
                    status = ?outcome.status,
                    latency_ms = outcome.latency_ms,
                    response = outcome.response_metadata.as_deref().unwrap_or(""),
                    "working proxy"
                );
                if let Err(e) = sink.record(candidate.class(), candidate.address()).await {
                    progress.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(proxy = %candidate, error = %e, "failed to record working proxy");
                }
                progress
                    .verified
                    .lock()
                    .await
                    .push(candidate.address().to_string());
                progress.succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                let reason = outcome.failure_reason.unwrap_or(FailureReason::ConnectFailed);
                debug!(
                    proxy = %candidate,
                    %reason,
                    detail = outcome.response_metadata.as_deref().unwrap_or(""),
                    "probe failed"
                );
                match reason {
                    FailureReason::Timeout => progress.timed_out.fetch_add(1, Ordering::Relaxed),
                    _ => progress.failed.fetch_add(1, Ordering::Relaxed),
                };
            }
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            // A panicking prober still counts as a concluded, failed attempt.
            progress.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "probe task aborted");
        }
    }

    progress.snapshot().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::sink::MemorySink;
    use crate::source::candidates_from_entries;
    use crate::types::{ProbeOutcome, ProtocolClass};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Succeeds for a fixed set of addresses, records every address it sees.
    struct StubProber {
        working: HashSet<String>,
        seen: std::sync::Mutex<Vec<String>>,
        delay: Duration,
        in_flight: AtomicU64,
        peak: AtomicU64,
    }

    impl StubProber {
        fn new(working: &[&str], delay: Duration) -> Self {
            Self {
                working: working.iter().map(|s| s.to_string()).collect(),
                seen: std::sync::Mutex::new(Vec::new()),
                delay,
                in_flight: AtomicU64::new(0),
                peak: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for StubProber {
        async fn probe(&self, candidate: &Candidate, _settings: &ProbeSettings) -> ProbeOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().push(candidate.address().to_string());
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.working.contains(candidate.address()) {
                ProbeOutcome::verified(candidate.clone(), 200, Some("ok".into()), 1)
            } else if candidate.address().starts_with("slow") {
                ProbeOutcome::failed(candidate.clone(), FailureReason::Timeout, None, 1)
            } else {
                ProbeOutcome::failed(candidate.clone(), FailureReason::ConnectFailed, None, 1)
            }
        }
    }

    /// Refuses to store `broken`, keeps everything else in memory.
    struct FailingSink {
        broken: &'static str,
        inner: MemorySink,
    }

    #[async_trait]
    impl ResultSink for FailingSink {
        async fn reset(&self, class: ProtocolClass) -> Result<(), SinkError> {
            self.inner.reset(class).await
        }

        async fn record(&self, class: ProtocolClass, address: &str) -> Result<(), SinkError> {
            if address == self.broken {
                return Err(SinkError::Write {
                    path: "broken.txt".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.record(class, address).await
        }

        async fn finalize(&self, class: ProtocolClass) -> Result<(), SinkError> {
            self.inner.finalize(class).await
        }
    }

    fn opts(concurrency: usize) -> DispatchOptions {
        DispatchOptions {
            concurrency,
            ..DispatchOptions::default()
        }
    }

    #[tokio::test]
    async fn blank_entries_never_reach_the_prober() {
        let prober = Arc::new(StubProber::new(&["1.2.3.4:8080"], Duration::ZERO));
        let sink = Arc::new(MemorySink::new());
        let candidates =
            candidates_from_entries(["1.2.3.4:8080", "", "5.6.7.8:1080"], ProtocolClass::Http);

        let summary = dispatch_all(candidates, &opts(8), prober.clone(), sink.clone()).await;

        assert_eq!(sink.lines(ProtocolClass::Http).await, vec!["1.2.3.4:8080"]);
        let mut seen = prober.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["1.2.3.4:8080", "5.6.7.8:1080"]);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.verified, vec!["1.2.3.4:8080"]);
    }

    #[tokio::test]
    async fn every_candidate_concludes_exactly_once() {
        let entries: Vec<String> = (0..250)
            .map(|i| match i % 3 {
                0 => format!("good{i}:1"),
                1 => format!("slow{i}:1"),
                _ => format!("dead{i}:1"),
            })
            .collect();
        let working: Vec<&str> = entries
            .iter()
            .filter(|e| e.starts_with("good"))
            .map(String::as_str)
            .collect();
        let prober = Arc::new(StubProber::new(&working, Duration::from_millis(1)));
        let sink = Arc::new(MemorySink::new());
        let candidates = candidates_from_entries(&entries, ProtocolClass::Socks5);

        let summary = dispatch_all(candidates, &opts(16), prober.clone(), sink.clone()).await;

        assert_eq!(summary.completed(), 250);
        assert_eq!(summary.succeeded, 84);
        assert_eq!(summary.timed_out, 83);
        assert_eq!(summary.failed, 83);
        assert_eq!(summary.cancelled, 0);
        assert_eq!(prober.seen.lock().unwrap().len(), 250);
        assert_eq!(sink.lines(ProtocolClass::Socks5).await.len(), 84);
    }

    #[tokio::test]
    async fn sink_write_failure_is_counted_and_batch_continues() {
        let prober = Arc::new(StubProber::new(&["a:1", "b:2", "c:3"], Duration::from_millis(1)));
        let sink = Arc::new(FailingSink {
            broken: "b:2",
            inner: MemorySink::new(),
        });
        let candidates = candidates_from_entries(["a:1", "b:2", "c:3", "d:4"], ProtocolClass::Http);

        let summary = dispatch_all(candidates, &opts(4), prober, sink.clone()).await;

        assert_eq!(summary.completed(), 4);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.write_errors, 1);
        let mut stored = sink.inner.lines(ProtocolClass::Http).await;
        stored.sort();
        assert_eq!(stored, vec!["a:1", "c:3"]);
    }

    #[tokio::test]
    async fn duplicate_successes_are_each_recorded() {
        let prober = Arc::new(StubProber::new(&["a:1"], Duration::ZERO));
        let sink = Arc::new(MemorySink::new());
        let candidates = candidates_from_entries(["a:1", "a:1"], ProtocolClass::Http);
        dispatch_all(candidates, &opts(4), prober, sink.clone()).await;
        assert_eq!(sink.lines(ProtocolClass::Http).await, vec!["a:1", "a:1"]);
    }

    #[tokio::test]
    async fn concurrency_ceiling_is_respected() {
        let entries: Vec<String> = (0..64).map(|i| format!("h{i}:1")).collect();
        let prober = Arc::new(StubProber::new(&[], Duration::from_millis(10)));
        let sink = Arc::new(MemorySink::new());
        let candidates = candidates_from_entries(&entries, ProtocolClass::Http);

        let summary = dispatch_all(candidates, &opts(4), prober.clone(), sink).await;

        assert_eq!(summary.completed(), 64);
        let peak = prober.peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak in-flight {peak}");
        assert!(peak >= 2, "expected some parallelism, peak {peak}");
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        let prober = Arc::new(StubProber::new(&[], Duration::ZERO));
        let sink = Arc::new(MemorySink::new());
        let summary = dispatch_all(Vec::new(), &opts(0), prober, sink).await;
        assert_eq!(summary.total, 0);
        assert_eq!(summary.completed(), 0);
    }

    #[tokio::test]
    async fn cancellation_accounts_for_every_candidate() {
        let entries: Vec<String> = (0..40).map(|i| format!("h{i}:1")).collect();
        let prober = Arc::new(StubProber::new(&[], Duration::from_secs(30)));
        let sink = Arc::new(MemorySink::new());
        let candidates = candidates_from_entries(&entries, ProtocolClass::Http);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let summary =
            dispatch_all_with_cancel(candidates, &opts(5), prober, sink, cancel).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.completed(), 0);
        assert_eq!(summary.cancelled, 40);
        assert_eq!(summary.attempted, 5);
    }

    #[tokio::test]
    async fn shared_progress_reflects_final_counts() {
        let prober = Arc::new(StubProber::new(&["a:1", "b:2"], Duration::ZERO));
        let sink = Arc::new(MemorySink::new());
        let shared = SharedProgress::new();
        let candidates = candidates_from_entries(["a:1", "b:2", "c:3"], ProtocolClass::Socks4);

        dispatch_all_with_shared(
            candidates,
            &opts(2),
            prober,
            sink,
            CancellationToken::new(),
            shared.clone(),
        )
        .await;

        assert_eq!(shared.done(), 3);
        let mut verified = shared.verified.lock().await.clone();
        verified.sort();
        assert_eq!(verified, vec!["a:1", "b:2"]);
    }
}
