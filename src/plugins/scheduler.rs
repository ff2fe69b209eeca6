//! Fixed-interval background loops.
//!
//! Every loop sleeps its interval, runs one unit of work in its own task,
//! logs the outcome, and repeats. An error or panic in one iteration is
//! logged and counted; the loop and its siblings keep running. There is no
//! backoff, no jitter, and no persisted next-run time.

use crate::core::broker::run_blocking;
use crate::core::config::{Config, LoopKind};
use crate::core::error::CustodesError;
use crate::core::store::Store;
use crate::plugins::agents;
use crate::plugins::auto_apply;
use crate::plugins::custody::CustodyService;
use crate::plugins::learning;
use crate::plugins::repo::RepoSource;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub type UnitFuture = Pin<Box<dyn Future<Output = Result<(), CustodesError>> + Send>>;
pub type UnitFn = Arc<dyn Fn() -> UnitFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub iterations: u64,
    pub failures: u64,
}

struct LoopSpec {
    name: String,
    interval: Duration,
    unit: UnitFn,
}

/// Per-persona loops count as failed when no persona completed.
fn require_progress(kind: LoopKind, completed: usize) -> Result<(), CustodesError> {
    if completed == 0 {
        return Err(CustodesError::TaskError(format!(
            "{} loop: every persona failed",
            kind
        )));
    }
    Ok(())
}

/// Shared handles every loop unit needs.
pub struct ServiceContext {
    pub store: Store,
    pub config: Arc<Config>,
    pub custody: Arc<CustodyService>,
    pub source: Arc<dyn RepoSource>,
}

pub struct Scheduler {
    loops: Vec<LoopSpec>,
    token: CancellationToken,
}

impl Scheduler {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            loops: Vec::new(),
            token,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn loop_names(&self) -> Vec<String> {
        self.loops.iter().map(|l| l.name.clone()).collect()
    }

    pub fn add_loop<F, Fut>(&mut self, name: &str, interval: Duration, unit: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CustodesError>> + Send + 'static,
    {
        let unit: UnitFn = Arc::new(move || Box::pin(unit()) as UnitFuture);
        self.loops.push(LoopSpec {
            name: name.to_string(),
            interval,
            unit,
        });
    }

    /// The production loop set, filtered by `scheduler.enabled_loops`.
    pub fn from_context(ctx: Arc<ServiceContext>, token: CancellationToken) -> Self {
        let mut scheduler = Scheduler::new(token);
        let sched_cfg = ctx.config.scheduler.clone();
        for kind in LoopKind::ALL {
            if !sched_cfg.enabled_loops.contains(&kind) {
                tracing::info!(loop_name = %kind, "loop disabled by config");
                continue;
            }
            let interval = sched_cfg.interval(kind);
            let ctx = ctx.clone();
            match kind {
                LoopKind::Custody => scheduler.add_loop(kind.as_str(), interval, move || {
                    let ctx = ctx.clone();
                    async move {
                        let reports = ctx.custody.administer_all().await;
                        require_progress(LoopKind::Custody, reports.len())
                    }
                }),
                LoopKind::Learning => scheduler.add_loop(kind.as_str(), interval, move || {
                    let ctx = ctx.clone();
                    async move {
                        let store = ctx.store.clone();
                        let gate = ctx.config.gate.clone();
                        let insights =
                            run_blocking(move || learning::learning_cycle(&store, &gate)).await?;
                        require_progress(LoopKind::Learning, insights.len())
                    }
                }),
                LoopKind::Olympic => scheduler.add_loop(kind.as_str(), interval, move || {
                    let ctx = ctx.clone();
                    async move {
                        ctx.custody.olympic_event().await?;
                        Ok::<(), CustodesError>(())
                    }
                }),
                LoopKind::Collaborative => scheduler.add_loop(kind.as_str(), interval, move || {
                    let ctx = ctx.clone();
                    async move {
                        ctx.custody.collaborative_test().await?;
                        Ok::<(), CustodesError>(())
                    }
                }),
                LoopKind::Proposal => scheduler.add_loop(kind.as_str(), interval, move || {
                    let ctx = ctx.clone();
                    async move {
                        let outcomes =
                            agents::run_all(&ctx.store, &ctx.config, ctx.source.as_ref()).await;
                        require_progress(LoopKind::Proposal, outcomes.len())
                    }
                }),
                LoopKind::AutoApply => scheduler.add_loop(kind.as_str(), interval, move || {
                    let ctx = ctx.clone();
                    async move {
                        let store = ctx.store.clone();
                        let workspace = ctx.config.apply_workspace();
                        run_blocking(move || auto_apply::apply_ready(&store, &workspace, false))
                            .await?;
                        Ok::<(), CustodesError>(())
                    }
                }),
            }
        }
        scheduler
    }

    /// Run every loop until the token is cancelled. Returns per-loop stats.
    pub async fn run(self) -> BTreeMap<String, LoopStats> {
        let mut set = JoinSet::new();
        tracing::info!(loops = ?self.loop_names(), "scheduler started");
        for spec in self.loops {
            let token = self.token.clone();
            set.spawn(async move {
                let stats = run_loop(&spec.name, spec.interval, spec.unit, token).await;
                (spec.name, stats)
            });
        }

        let mut all = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, stats)) => {
                    all.insert(name, stats);
                }
                Err(e) => tracing::error!(error = %e, "scheduler loop task ended abnormally"),
            }
        }
        tracing::info!("scheduler stopped");
        all
    }
}

async fn run_loop(
    name: &str,
    interval: Duration,
    unit: UnitFn,
    token: CancellationToken,
) -> LoopStats {
    let mut stats = LoopStats::default();
    tracing::info!(loop_name = name, interval_secs = interval.as_secs(), "loop started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        stats.iterations += 1;
        let mut handle = tokio::spawn(unit());
        let joined = tokio::select! {
            _ = token.cancelled() => {
                handle.abort();
                tracing::info!(loop_name = name, "shutdown during iteration; aborted");
                break;
            }
            joined = &mut handle => joined,
        };
        match joined {
            Ok(Ok(())) => {
                tracing::debug!(loop_name = name, iteration = stats.iterations, "loop iteration finished")
            }
            Ok(Err(e)) => {
                stats.failures += 1;
                tracing::error!(loop_name = name, iteration = stats.iterations, error = %e, "loop iteration failed");
            }
            Err(e) => {
                stats.failures += 1;
                tracing::error!(loop_name = name, iteration = stats.iterations, error = %e, "loop iteration panicked");
            }
        }
    }
    tracing::info!(loop_name = name, iterations = stats.iterations, failures = stats.failures, "loop stopped");
    stats
}
