use std::collections::BTreeMap;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::loadbalancer::{Frontend, L3n4Addr, Status};
use crate::metrics::{ReconcileMetrics, to_gauge};
use crate::reconciler::Operations;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub enum Event {
    Upsert(Frontend),
    Delete(Frontend),
}

impl Event {
    pub fn frontend(&self) -> &Frontend {
        match self {
            Event::Upsert(fe) | Event::Delete(fe) => fe,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Event::Upsert(_) => "update",
            Event::Delete(_) => "delete",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RunnerConfig {
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
    pub prune_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_backoff_min: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(60),
            prune_interval: Duration::from_secs(300),
        }
    }
}

struct Retry {
    event: Event,
    attempts: u32,
    due: Instant,
}

/// Applies desired state events one at a time, retrying failed ones with
/// exponential backoff and pruning the tables periodically.
pub struct Runner<O> {
    ops: O,
    config: RunnerConfig,
    events: mpsc::Receiver<Event>,
    metrics: ReconcileMetrics,
    desired: BTreeMap<L3n4Addr, Frontend>,
    retries: ahash::HashMap<L3n4Addr, Retry>,
}

impl<O: Operations<Frontend>> Runner<O> {
    pub fn new(
        ops: O,
        config: RunnerConfig,
        events: mpsc::Receiver<Event>,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            ops,
            config,
            events,
            metrics,
            desired: BTreeMap::new(),
            retries: ahash::HashMap::default(),
        }
    }

    /// Runs until cancelled or until every event sender is dropped.
    ///
    /// The first prune happens one interval after start so that ids restored
    /// from the tables can be claimed by the initial desired state.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut prune = tokio::time::interval_at(
            Instant::now() + self.config.prune_interval,
            self.config.prune_interval,
        );
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_retry = self.retries.values().map(|r| r.due).min();
            select! {
                _ = cancel.cancelled() => {
                    info!("stopping reconciler");
                    return Ok(());
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        info!("desired state closed, stopping reconciler");
                        return Ok(());
                    }
                },
                _ = sleep_until(next_retry) => self.retry_due(Instant::now()),
                _ = prune.tick() => self.prune(),
            }
        }
    }

    /// Applies a new event. A pending retry for the same frontend is dropped
    /// since the event carries newer desired state.
    pub(crate) fn handle(&mut self, event: Event) {
        self.retries.remove(&event.frontend().address);
        self.apply(event, 0);
    }

    pub(crate) fn retry_due(&mut self, now: Instant) {
        let due: Vec<L3n4Addr> = self
            .retries
            .iter()
            .filter(|(_, retry)| retry.due <= now)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in due {
            if let Some(retry) = self.retries.remove(&addr) {
                self.apply(retry.event, retry.attempts);
            }
        }
    }

    pub(crate) fn prune(&mut self) {
        let _measurer = self.metrics.count_and_measure("prune");
        let mut live = self.desired.values();
        if let Err(e) = self.ops.prune(&mut live) {
            warn!(error = %e, "pruning failed");
            self.metrics.count_failure("prune", &e);
        }
    }

    fn apply(&mut self, event: Event, attempts: u32) {
        let operation = event.operation();
        let result = {
            let _measurer = self.metrics.count_and_measure(operation);
            match &event {
                Event::Upsert(fe) => self.ops.update(fe),
                Event::Delete(fe) => self.ops.delete(fe),
            }
        };

        match (result, event) {
            (Ok(()), Event::Upsert(mut fe)) => {
                fe.set_status(Status::done());
                self.desired.insert(fe.address, fe);
            }
            (Ok(()), Event::Delete(fe)) => {
                self.desired.remove(&fe.address);
            }
            (Err(e), event) => {
                self.metrics.count_failure(operation, &e);
                let attempts = attempts.saturating_add(1);
                let delay = self.backoff(attempts, &e);
                let frontend = event.frontend().address;
                if e.is_retryable() {
                    warn!(%frontend, operation, attempts, ?delay, error = %e, "reconciliation failed");
                } else {
                    error!(%frontend, operation, attempts, ?delay, error = %e, "reconciliation failed and needs intervention");
                }
                if let Event::Upsert(fe) = &event {
                    let mut fe = fe.clone();
                    fe.set_status(Status::error(&e));
                    self.desired.insert(fe.address, fe);
                }
                self.retries.insert(
                    frontend,
                    Retry {
                        event,
                        attempts,
                        due: Instant::now() + delay,
                    },
                );
            }
        }

        self.metrics
            .desired_frontends
            .set(to_gauge(self.desired.len()));
        self.metrics
            .pending_retries
            .set(to_gauge(self.retries.len()));
    }

    fn backoff(&self, attempts: u32, e: &Error) -> Duration {
        if !e.is_retryable() {
            return self.config.retry_backoff_max;
        }
        let exponent = attempts.saturating_sub(1).min(20);
        self.config
            .retry_backoff_min
            .saturating_mul(1 << exponent)
            .min(self.config.retry_backoff_max)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::loadbalancer::{L4Protocol, Scope, Service, ServiceType, StatusKind};

    #[derive(Clone, Default)]
    struct FakeOps {
        calls: Arc<Mutex<Vec<String>>>,
        failures: Arc<Mutex<usize>>,
        fatal: bool,
    }

    impl FakeOps {
        fn record(&self, call: String) -> Result<()> {
            self.calls.lock().unwrap().push(call);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(if self.fatal {
                    Error::MapFull
                } else {
                    Error::Other("injected".into())
                });
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Operations<Frontend> for FakeOps {
        fn update(&self, obj: &Frontend) -> Result<()> {
            self.record(format!("update {}", obj.address))
        }

        fn delete(&self, obj: &Frontend) -> Result<()> {
            self.record(format!("delete {}", obj.address))
        }

        fn prune(&self, live: &mut dyn Iterator<Item = &Frontend>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("prune {}", live.count()));
            Ok(())
        }
    }

    fn fe() -> Frontend {
        Frontend::new(
            L3n4Addr::new(
                IpAddr::V4(Ipv4Addr::new(10, 96, 0, 10)).into(),
                L4Protocol::Tcp,
                80,
                Scope::External,
            ),
            ServiceType::ClusterIp,
            Arc::new(Service::default()),
            vec![],
        )
    }

    fn config() -> RunnerConfig {
        RunnerConfig {
            retry_backoff_min: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(10),
            prune_interval: Duration::from_secs(60),
        }
    }

    fn runner(ops: FakeOps) -> (Runner<FakeOps>, mpsc::Sender<Event>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Runner::new(ops, config(), rx, ReconcileMetrics::unregistered()),
            tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_backs_off_exponentially() {
        let ops = FakeOps::default();
        *ops.failures.lock().unwrap() = 2;
        let (mut runner, _tx) = runner(ops.clone());
        let addr = fe().address;

        runner.handle(Event::Upsert(fe()));
        assert_eq!(runner.retries[&addr].attempts, 1);
        assert_eq!(
            runner.desired[&addr].status().kind,
            StatusKind::Error
        );

        runner.retry_due(Instant::now());
        assert_eq!(ops.calls().len(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        runner.retry_due(Instant::now());
        assert_eq!(ops.calls().len(), 2);
        assert_eq!(
            runner.retries[&addr].due - Instant::now(),
            Duration::from_millis(200)
        );

        tokio::time::advance(Duration::from_millis(200)).await;
        runner.retry_due(Instant::now());
        assert_eq!(ops.calls().len(), 3);
        assert!(runner.retries.is_empty());
        assert_eq!(runner.desired[&addr].status().kind, StatusKind::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_event_supersedes_retry() {
        let ops = FakeOps::default();
        *ops.failures.lock().unwrap() = 1;
        let (mut runner, _tx) = runner(ops.clone());

        runner.handle(Event::Upsert(fe()));
        assert_eq!(runner.retries.len(), 1);

        runner.handle(Event::Delete(fe()));
        assert!(runner.retries.is_empty());
        assert!(runner.desired.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        runner.retry_due(Instant::now());
        assert_eq!(
            ops.calls(),
            vec![
                "update 10.96.0.10:80/TCP".to_string(),
                "delete 10.96.0.10:80/TCP".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_waits_for_max_backoff() {
        let ops = FakeOps {
            fatal: true,
            ..Default::default()
        };
        *ops.failures.lock().unwrap() = 1;
        let (mut runner, _tx) = runner(ops.clone());
        let addr = fe().address;

        runner.handle(Event::Upsert(fe()));
        assert_eq!(
            runner.retries[&addr].due - Instant::now(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let (runner, _tx) = runner(FakeOps::default());
        let e = Error::Other("x".into());
        assert_eq!(runner.backoff(1, &e), Duration::from_millis(100));
        assert_eq!(runner.backoff(4, &e), Duration::from_millis(800));
        assert_eq!(runner.backoff(30, &e), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_applies_events_and_prunes() {
        let ops = FakeOps::default();
        let (runner, tx) = runner(ops.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runner.run(cancel.clone()));

        tx.send(Event::Upsert(fe())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            ops.calls(),
            vec!["update 10.96.0.10:80/TCP".to_string(), "prune 1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_stops_when_senders_are_dropped() {
        let (runner, tx) = runner(FakeOps::default());
        drop(tx);
        runner.run(CancellationToken::new()).await.unwrap();
    }
}
