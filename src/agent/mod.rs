//! Reconcile agent.
//!
//! Each tick polls the control plane for an [`AgentState`] and fans its
//! buckets out to a bounded pool of workers. Every worker compiles,
//! converts and drives one run through the [`Executor`], reporting the
//! outcome back as a [`StatusCondition`].
//!
//! The loop backs off exponentially while there is no work and polls at
//! the minimum interval as soon as any bucket is non-empty. On shutdown
//! the loop stops polling and waits for in-flight workers.

mod control_plane;
mod executor;
mod handlers;
pub mod heartbeat;
mod kubernetes;
mod state;

pub use control_plane::{ControlPlane, HttpControlPlane};
pub use executor::{DockerExecutor, DockerPlan, DryRunExecutor, Executor};
pub use handlers::{Handler, Handlers};
pub use kubernetes::{KubeSettings, KubernetesExecutor};
pub use state::{
    error_summary, AgentState, AgentStatus, RunEntry, RunStatus, StateBuckets, StatusCondition, LIVE,
};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;

/// Loop timing and pool size.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub max_workers: usize,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub sleep_stop_time: Duration,
    pub sleep_archived_time: Duration,
    pub heartbeat_path: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(6),
            sleep_stop_time: Duration::from_secs(60),
            sleep_archived_time: Duration::from_secs(1800),
            heartbeat_path: None,
        }
    }
}

/// Poll interval that doubles on empty polls and resets when there is work.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    pub fn next(&mut self, full: bool) -> Duration {
        self.current = if full {
            self.min
        } else {
            (self.current * 2).min(self.max)
        };
        self.current
    }
}

pub struct Agent {
    control_plane: Arc<dyn ControlPlane>,
    handlers: Arc<Handlers>,
    settings: AgentSettings,
    permits: Arc<Semaphore>,
    /// Runs with a worker in flight, so a repeated poll does not dispatch them twice.
    inflight: Arc<Mutex<HashSet<String>>>,
    shutdown: ShutdownCoordinator,
}

impl Agent {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        handlers: Handlers,
        settings: AgentSettings,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_workers.max(1)));
        Self {
            control_plane,
            handlers: Arc::new(handlers),
            settings,
            permits,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Poll until shutdown is requested, then drain in-flight workers.
    pub async fn run(&self) -> Result<()> {
        info!(max_workers = self.settings.max_workers, "Agent started");
        let mut workers = JoinSet::new();
        let mut backoff = Backoff::new(self.settings.min_interval, self.settings.max_interval);

        while !self.shutdown.is_shutdown_requested() {
            let delay = self.tick(&mut workers, &mut backoff).await;
            while let Some(result) = workers.try_join_next() {
                reap(result);
            }
            tokio::select! {
                _ = self.shutdown.wait_for_shutdown() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(inflight = workers.len(), "Agent stopping, waiting for in-flight runs");
        while let Some(result) = workers.join_next().await {
            reap(result);
        }
        info!("Agent stopped");
        Ok(())
    }

    /// One poll; returns how long to sleep before the next one.
    pub async fn tick(&self, workers: &mut JoinSet<()>, backoff: &mut Backoff) -> Duration {
        let state = match self.control_plane.get_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(code = e.code(), "Failed to poll agent state: {}", e);
                metrics::record_agent_tick("error");
                return backoff.next(false);
            }
        };

        if let Some(path) = &self.settings.heartbeat_path {
            if let Err(e) = heartbeat::touch(path) {
                warn!(path = %path.display(), "Failed to touch heartbeat: {}", e);
            }
        }

        if state.is_stopped() {
            debug!("Agent is stopped on the control plane");
            metrics::record_agent_tick("stopped");
            return self.settings.sleep_stop_time;
        }
        if !state.is_live() {
            debug!(live_state = state.live_state, "Agent is archived on the control plane");
            metrics::record_agent_tick("archived");
            return self.settings.sleep_archived_time;
        }

        metrics::record_agent_tick("live");
        let full = state.is_full();
        self.dispatch(&state, workers);
        backoff.next(full)
    }

    /// Spawn one worker per bucket entry; returns how many were dispatched.
    pub fn dispatch(&self, state: &AgentState, workers: &mut JoinSet<()>) -> usize {
        let mut dispatched = 0;
        for (bucket, entries) in state.state.iter() {
            if entries.is_empty() {
                continue;
            }
            let Some(handler) = Handler::for_bucket(bucket) else {
                continue;
            };
            let mut count = 0;
            for entry in entries {
                let Some(claim) = self.claim(&entry.run_uuid) else {
                    debug!(bucket, run_uuid = %entry.run_uuid, "Run already in flight");
                    continue;
                };
                let handlers = self.handlers.clone();
                let permits = self.permits.clone();
                let entry = entry.clone();
                workers.spawn(async move {
                    // released on completion, panic or abort
                    let _claim = claim;
                    if let Ok(_permit) = permits.acquire_owned().await {
                        handlers.handle(handler, entry).await;
                    }
                });
                count += 1;
            }
            if count > 0 {
                debug!(bucket, count, handler = handler.as_str(), "Dispatched runs");
                metrics::record_dispatch(bucket, count);
            }
            dispatched += count;
        }
        dispatched
    }

    fn claim(&self, uuid: &str) -> Option<Claim> {
        let mut set = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(uuid.to_string()).then(|| Claim {
            inflight: self.inflight.clone(),
            uuid: uuid.to_string(),
        })
    }
}

/// Marks a run as in flight until dropped.
struct Claim {
    inflight: Arc<Mutex<HashSet<String>>>,
    uuid: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut set = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.uuid);
    }
}

fn reap(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!("Agent worker panicked: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::handlers::tests::{handlers, StubControlPlane, StubExecutor, JOB};
    use super::*;
    use std::sync::atomic::Ordering;

    fn agent(cp: Arc<StubControlPlane>, executor: Arc<StubExecutor>, settings: AgentSettings) -> Agent {
        let handlers = handlers(cp.clone(), executor);
        Agent::new(cp, handlers, settings, ShutdownCoordinator::new())
    }

    fn queued_state() -> AgentState {
        AgentState {
            state: StateBuckets {
                queued: vec![
                    RunEntry::new("acme", "mnist", "u1").with_content(JOB),
                    RunEntry::new("acme", "mnist", "u2").with_content(JOB),
                ],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next(false), Duration::from_millis(200));
        assert_eq!(backoff.next(false), Duration::from_millis(350));
        assert_eq!(backoff.next(false), Duration::from_millis(350));
        assert_eq!(backoff.next(true), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_tick_dispatches_and_touches_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let heartbeat_path = dir.path().join("heartbeat");
        let cp = Arc::new(StubControlPlane::default());
        *cp.state.lock().unwrap() = queued_state();
        let executor = Arc::new(StubExecutor::default());
        let settings = AgentSettings {
            max_workers: 1,
            heartbeat_path: Some(heartbeat_path.clone()),
            ..Default::default()
        };
        let agent = agent(cp.clone(), executor.clone(), settings.clone());

        let mut workers = JoinSet::new();
        let mut backoff = Backoff::new(settings.min_interval, settings.max_interval);
        let delay = agent.tick(&mut workers, &mut backoff).await;
        assert_eq!(delay, settings.min_interval);
        while workers.join_next().await.is_some() {}

        assert_eq!(executor.creates.load(Ordering::SeqCst), 2);
        assert!(cp.status_types().is_empty());
        assert!(heartbeat::pong(&heartbeat_path, Duration::from_secs(60)).unwrap());
    }

    #[tokio::test]
    async fn test_in_flight_runs_are_not_dispatched_twice() {
        let cp = Arc::new(StubControlPlane::default());
        let agent = agent(cp, Arc::new(StubExecutor::default()), AgentSettings::default());
        let state = queued_state();

        let mut workers = JoinSet::new();
        assert_eq!(agent.dispatch(&state, &mut workers), 2);
        assert_eq!(agent.dispatch(&state, &mut workers), 0);
        while workers.join_next().await.is_some() {}
        assert_eq!(agent.dispatch(&state, &mut workers), 2);
        while workers.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_panicking_worker_releases_its_run() {
        let cp = Arc::new(StubControlPlane::default());
        let agent = agent(cp, Arc::new(StubExecutor::default()), AgentSettings::default());
        let state = queued_state();

        let claim = agent.claim("u1").unwrap();
        assert!(agent.claim("u1").is_none());
        let mut workers = JoinSet::new();
        workers.spawn(async move {
            let _claim = claim;
            panic!("handler blew up");
        });
        let joined = workers.join_next().await.unwrap();
        assert!(joined.unwrap_err().is_panic());

        assert!(agent.inflight.lock().unwrap().is_empty());
        assert_eq!(agent.dispatch(&state, &mut workers), 2);
        while workers.join_next().await.is_some() {}
        assert!(agent.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_and_archived_sleep() {
        let cp = Arc::new(StubControlPlane::default());
        let settings = AgentSettings::default();
        let agent = agent(cp.clone(), Arc::new(StubExecutor::default()), settings.clone());
        let mut workers = JoinSet::new();
        let mut backoff = Backoff::new(settings.min_interval, settings.max_interval);

        cp.state.lock().unwrap().status = AgentStatus::Stopped;
        assert_eq!(agent.tick(&mut workers, &mut backoff).await, settings.sleep_stop_time);

        *cp.state.lock().unwrap() = AgentState {
            live_state: 0,
            ..queued_state()
        };
        assert_eq!(agent.tick(&mut workers, &mut backoff).await, settings.sleep_archived_time);
        assert!(workers.is_empty());

        *cp.state.lock().unwrap() = AgentState::default();
        assert_eq!(agent.tick(&mut workers, &mut backoff).await, settings.min_interval * 2);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let cp = Arc::new(StubControlPlane::default());
        let shutdown = ShutdownCoordinator::new();
        let handlers = handlers(cp.clone(), Arc::new(StubExecutor::default()));
        let settings = AgentSettings {
            min_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let agent = Arc::new(Agent::new(cp.clone(), handlers, settings, shutdown.clone()));

        let runner = agent.clone();
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.request_shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(result.unwrap().unwrap().is_ok());
        assert!(cp.polls.load(Ordering::SeqCst) >= 1);
    }
}
