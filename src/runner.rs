use std::collections::BTreeMap;
use std::sync::Arc;

use ::time::{format_description::well_known, OffsetDateTime};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ClassConfig, Config};
use crate::dispatcher::{self, DispatchOptions, SharedProgress};
use crate::probe::{HttpProber, Prober};
use crate::sink::{FileSink, ResultSink};
use crate::source::{EndpointSource, ListSource};
use crate::types::{ClassReport, ProtocolClass, RunReport};

/// Live progress for every class of a run, keyed by class.
#[derive(Clone, Debug, Default)]
pub struct RunProgress {
    pub classes: BTreeMap<ProtocolClass, SharedProgress>,
}

impl RunProgress {
    pub fn for_config(cfg: &Config) -> Self {
        let classes = cfg
            .classes
            .iter()
            .map(|c| (c.class, SharedProgress::new()))
            .collect();
        Self { classes }
    }

    pub fn totals(&self) -> (u64, u64, u64) {
        use std::sync::atomic::Ordering;
        self.classes.values().fold((0, 0, 0), |(t, d, v), p| {
            (
                t + p.total.load(Ordering::Relaxed),
                d + p.done(),
                v + p.succeeded.load(Ordering::Relaxed),
            )
        })
    }
}

/// Wires a list source, a prober and a sink into per-class probing batches.
#[derive(Clone)]
pub struct Runner {
    config: Config,
    source: Arc<dyn EndpointSource>,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn ResultSink>,
}

impl Runner {
    pub fn new(
        config: Config,
        source: Arc<dyn EndpointSource>,
        prober: Arc<dyn Prober>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            source,
            prober,
            sink,
        }
    }

    /// Remote/local lists, real proxied requests, one output file per class.
    pub fn from_config(config: Config) -> Self {
        let source = Arc::new(ListSource::new(&config.classes));
        let sink = Arc::new(FileSink::from_classes(&config.classes));
        Self::new(config, source, Arc::new(HttpProber), sink)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Same source, prober and sink with different run parameters.
    pub fn with_config(&self, config: Config) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }

    pub async fn run(&self) -> RunReport {
        let cfg = &self.config;
        self.run_with(CancellationToken::new(), RunProgress::for_config(cfg))
            .await
    }

    /// Run every configured class concurrently and wait for all of them.
    ///
    /// An unavailable list leaves its class empty; it never stops the others.
    /// Cancelling `cancel` stops new attempts, abandons in-flight ones, and
    /// still finalizes every sink before returning.
    pub async fn run_with(&self, cancel: CancellationToken, progress: RunProgress) -> RunReport {
        let started_at = now_rfc3339();
        let opts = DispatchOptions::from(&self.config);
        let mut set = JoinSet::new();

        for class_cfg in self.config.classes.clone() {
            let shared = progress
                .classes
                .get(&class_cfg.class)
                .cloned()
                .unwrap_or_default();
            let job = ClassJob {
                class_cfg,
                source: self.source.clone(),
                prober: self.prober.clone(),
                sink: self.sink.clone(),
                opts: opts.clone(),
                cancel: cancel.child_token(),
                shared,
            };
            set.spawn(job.run());
        }

        let mut classes = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(report) => classes.push(report),
                Err(e) => warn!(error = %e, "class batch aborted"),
            }
        }
        let order = |c: ProtocolClass| {
            self.config
                .classes
                .iter()
                .position(|cc| cc.class == c)
                .unwrap_or(usize::MAX)
        };
        classes.sort_by_key(|r| order(r.class));

        let report = RunReport {
            started_at,
            finished_at: now_rfc3339(),
            cancelled: cancel.is_cancelled(),
            classes,
        };
        info!(
            verified = report.total_verified(),
            cancelled = report.cancelled,
            "all requests completed"
        );
        report
    }
}

struct ClassJob {
    class_cfg: ClassConfig,
    source: Arc<dyn EndpointSource>,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn ResultSink>,
    opts: DispatchOptions,
    cancel: CancellationToken,
    shared: SharedProgress,
}

impl ClassJob {
    async fn run(self) -> ClassReport {
        let class = self.class_cfg.class;
        let origin = self.source.describe(class);

        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err("cancelled before list was loaded".to_string()),
            res = self.source.fetch(class) => res.map_err(|e| e.to_string()),
        };
        let (candidates, list_error) = match fetched {
            Ok(c) => {
                info!(%class, source = %origin, candidates = c.len(), "loaded candidate list");
                (c, None)
            }
            Err(e) => {
                warn!(%class, source = %origin, error = %e, "candidate list unavailable, probing none");
                (Vec::new(), Some(e))
            }
        };

        if let Err(e) = self.sink.reset(class).await {
            warn!(%class, error = %e, "failed to clear previous results");
        }

        let summary = dispatcher::dispatch_all_with_shared(
            candidates,
            &self.opts,
            self.prober,
            self.sink.clone(),
            self.cancel,
            self.shared,
        )
        .await;

        if let Err(e) = self.sink.finalize(class).await {
            warn!(%class, error = %e, "failed to finalize results");
        }
        info!(
            %class,
            total = summary.total,
            verified = summary.succeeded,
            failed = summary.failed,
            timed_out = summary.timed_out,
            cancelled = summary.cancelled,
            "batch complete"
        );

        ClassReport {
            class,
            source: origin,
            output: self.class_cfg.output.display().to_string(),
            list_available: list_error.is_none(),
            list_error,
            summary,
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
