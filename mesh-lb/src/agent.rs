use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bpf::lbmap::{self, LbMaps};
use crate::config::AgentArgs;
use crate::metrics::{ReconcileMetrics, StateMetrics};
use crate::reconciler::ops::BpfOps;
use crate::reconciler::runner::Runner;
use crate::source::FileSource;
use crate::{Error, Result};

const EVENT_BUFFER: usize = 1024;
const STATS_INTERVAL: Duration = Duration::from_secs(15);

pub async fn start(
    args: AgentArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    info!("loading pinned maps from {}", args.bpf_fs.display());
    let maps = lbmap::load_pinned(&args.bpf_fs)?;
    run(maps, args, ready, cancel).await
}

/// Restores the reconciler from `maps` and drives it from the desired state
/// file until cancelled or one of the tasks stops.
pub(crate) async fn run<M>(
    maps: M,
    args: AgentArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()>
where
    M: LbMaps + Send + 'static,
{
    info!("restoring reconciler state");
    let ops = BpfOps::restore(maps, args.ops_config())?;
    let stats = ops.stats()?;
    info!(
        service_ids = stats.service_ids,
        backend_ids = stats.backend_ids,
        "restored ids from maps"
    );

    let reconcile_metrics = ReconcileMetrics::new()?;
    let state_metrics = StateMetrics::new()?;
    state_metrics.record(&stats);

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let runner = Runner::new(ops.clone(), args.runner_config(), rx, reconcile_metrics);
    let source = FileSource::new(&args.state_file);

    let mut tasks = JoinSet::new();
    let token = cancel.child_token();
    tasks.spawn(async move { ("reconciler", runner.run(token).await) });
    let token = cancel.child_token();
    let refresh = args.state_refresh_interval;
    tasks.spawn(async move { ("desired state", source.run(refresh, tx, token).await) });
    let token = cancel.child_token();
    tasks.spawn(async move { ("stats", record_stats(ops, state_metrics, token).await) });

    ready.cancel();
    info!("agent ready");

    let first = select! {
        _ = cancel.cancelled() => None,
        joined = tasks.join_next() => joined,
    };
    let mut result = match first {
        Some(joined) => finished(joined),
        None => Ok(()),
    };

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = finished(joined) {
            result = result.and(Err(e));
        }
    }
    result
}

fn finished(joined: std::result::Result<(&'static str, Result<()>), JoinError>) -> Result<()> {
    match joined {
        Ok((task, out)) => exited(task, Ok(out)),
        Err(e) => exited("agent", Err(e)),
    }
}

/// Logs how a task ended. A task that failed, panicked or was cancelled is
/// an error.
pub fn exited(task: &str, out: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match out {
        Ok(Ok(())) => {
            info!("{task} exited");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}");
            Err(e)
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            Err(Error::Task(e.to_string()))
        }
    }
}

async fn record_stats<M: LbMaps>(
    ops: BpfOps<M>,
    metrics: StateMetrics,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    loop {
        select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => metrics.record(&ops.stats()?),
        }
    }
}
