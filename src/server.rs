use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::runner::{RunProgress, Runner};
use crate::types::{ProtocolClass, RunReport};

#[derive(Clone)]
pub struct AppState {
    runner: Runner,
    inner: Arc<RwLock<ServerState>>, // shared mutable state for progress/results
}

impl AppState {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            inner: Arc::new(RwLock::new(ServerState {
                state: RunState::Idle,
                results: None,
                progress: None,
                cancel: None,
                task: None,
            })),
        }
    }

    /// Cancel the current run, if any, and wait up to `grace` for it to
    /// finalize its outputs. Returns false if the run was still going.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let (cancel, task) = {
            let mut s = self.inner.write().await;
            (s.cancel.clone(), s.task.take())
        };
        if let Some(c) = cancel {
            c.cancel();
        }
        let Some(task) = task else {
            return true;
        };
        match tokio::time::timeout(grace, task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "run did not finish before shutdown"
                );
                false
            }
        }
    }
}

#[derive(Debug)]
struct ServerState {
    state: RunState,
    results: Option<RunReport>,
    progress: Option<RunProgress>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ClassStatus {
    pub total: u64,
    pub done: u64,
    pub verified: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: RunState,
    pub total: u64,
    pub done: u64,
    pub verified: u64,
    pub classes: BTreeMap<ProtocolClass, ClassStatus>,
}

/// Optional per-run overrides of the server's base configuration.
#[derive(Debug, Deserialize, Default)]
pub struct RunRequest {
    #[serde(default)]
    pub classes: Vec<ProtocolClass>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub strict_status: Option<bool>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/run", post(post_run))
        .route("/cancel", post(post_cancel))
        .route("/results", get(get_results))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let app = router(state);
    info!(%bind, "serving status API");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

fn status_of(state: RunState, progress: &RunProgress) -> Status {
    let classes: BTreeMap<_, _> = progress
        .classes
        .iter()
        .map(|(class, p)| {
            (
                *class,
                ClassStatus {
                    total: p.total.load(Ordering::Relaxed),
                    done: p.done(),
                    verified: p.succeeded.load(Ordering::Relaxed),
                },
            )
        })
        .collect();
    let (total, done, verified) = progress.totals();
    Status {
        state,
        total,
        done,
        verified,
        classes,
    }
}

fn status_of_report(report: &RunReport) -> Status {
    let classes: BTreeMap<_, _> = report
        .classes
        .iter()
        .map(|c| {
            (
                c.class,
                ClassStatus {
                    total: c.summary.total,
                    done: c.summary.completed(),
                    verified: c.summary.succeeded,
                },
            )
        })
        .collect();
    Status {
        state: RunState::Done,
        total: classes.values().map(|c| c.total).sum(),
        done: classes.values().map(|c| c.done).sum(),
        verified: classes.values().map(|c| c.verified).sum(),
        classes,
    }
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let out = match (s.progress.as_ref(), s.results.as_ref()) {
        (Some(p), _) => status_of(s.state, p),
        (None, Some(r)) => status_of_report(r),
        (None, None) => status_of(s.state, &RunProgress::default()),
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    if let Some(res) = s.results.as_ref() {
        (StatusCode::OK, Json(res.clone())).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match (s.state, s.cancel.as_ref()) {
        (RunState::Running, Some(c)) => {
            c.cancel();
            StatusCode::ACCEPTED
        }
        _ => StatusCode::CONFLICT,
    }
}

async fn post_run(State(app): State<AppState>, Json(req): Json<RunRequest>) -> impl IntoResponse {
    let mut config = app.runner.config().clone();
    config.retain_classes(&req.classes);
    if let Some(c) = req.concurrency {
        config.concurrency = c;
    }
    if let Some(t) = req.timeout_ms {
        config.timeout_ms = t;
    }
    if let Some(s) = req.strict_status {
        config.strict_status = s;
    }
    if let Err(e) = config.validate() {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let runner = app.runner.with_config(config);
    let progress = RunProgress::for_config(runner.config());
    let cancel = CancellationToken::new();
    let initial = status_of(RunState::Running, &progress);

    // Spawned under the write lock so `shutdown` always sees the handle.
    let mut s = app.inner.write().await;
    // Two runs would race on the same output files.
    if s.state == RunState::Running {
        return (StatusCode::CONFLICT, "a run is already in progress").into_response();
    }
    s.state = RunState::Running;
    s.results = None;
    s.progress = Some(progress.clone());
    s.cancel = Some(cancel.clone());

    let app2 = app.clone();
    s.task = Some(tokio::spawn(async move {
        let report = runner.run_with(cancel, progress).await;
        let mut s = app2.inner.write().await;
        s.state = RunState::Done;
        s.results = Some(report);
        s.progress = None;
        s.cancel = None;
    }));

    (StatusCode::ACCEPTED, Json(initial)).into_response()
}
