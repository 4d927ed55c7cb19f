use std::{
    collections::{HashMap, VecDeque},
    process::ExitStatus,
    time::Duration,
};
use stratus_model::strategy::StrategyId;
use tokio::{process::Child, time::Instant};
use tracing::{info, warn};

/// Restart policy for crashed workers.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker binary, resolved from `PATH` or an absolute path.
    pub binary: String,
    /// Config file handed to every worker.
    pub config_path: String,
    /// Base delay before a restart; doubled per consecutive crash.
    pub restart_backoff: Duration,
    /// Crashes tolerated inside the rolling window before giving up.
    pub max_restarts_per_window: u32,
    pub restart_window: Duration,
}

/// What to do after a worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartAfter(Duration),
    /// The restart budget is exhausted: deactivate the strategy and alert.
    GiveUp,
}

/// Rolling-window crash counter per strategy.
#[derive(Debug, Default)]
pub struct RestartTracker {
    crashes: VecDeque<Instant>,
}

impl RestartTracker {
    /// Record a crash at `now` and decide the response.
    pub fn on_crash(&mut self, now: Instant, config: &SupervisorConfig) -> RestartDecision {
        while let Some(oldest) = self.crashes.front() {
            if now.duration_since(*oldest) > config.restart_window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);

        let strikes = self.crashes.len() as u32;
        if strikes > config.max_restarts_per_window {
            RestartDecision::GiveUp
        } else {
            let exponent = strikes.saturating_sub(1).min(16);
            RestartDecision::RestartAfter(config.restart_backoff * 2u32.pow(exponent))
        }
    }

    /// Forget history, eg/ after an operator manually restarts the strategy.
    pub fn reset(&mut self) {
        self.crashes.clear();
    }
}

/// Events surfaced by [`Supervisor::poll`] for the engine loop to act on.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A worker process exited without being asked to.
    Exited {
        strategy_id: StrategyId,
        status: ExitStatus,
    },
    /// A scheduled restart is due.
    RestartDue { strategy_id: StrategyId },
}

/// Spawns and watches one OS process per running strategy.
///
/// Process isolation is the containment mechanism: a crashed worker takes
/// down nothing but itself, and the engine observes the exit here.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    children: HashMap<StrategyId, Child>,
    trackers: HashMap<StrategyId, RestartTracker>,
    pending_restarts: Vec<(StrategyId, Instant)>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            children: HashMap::new(),
            trackers: HashMap::new(),
            pending_restarts: Vec::new(),
        }
    }

    pub fn is_running(&self, strategy_id: StrategyId) -> bool {
        self.children.contains_key(&strategy_id)
    }

    pub fn running_count(&self) -> usize {
        self.children.len()
    }

    /// Spawn a worker process for `strategy_id`.
    pub fn spawn_worker(&mut self, strategy_id: StrategyId) -> std::io::Result<()> {
        if self.is_running(strategy_id) {
            return Ok(());
        }
        let child = tokio::process::Command::new(&self.config.binary)
            .arg("--config")
            .arg(&self.config.config_path)
            .arg("--strategy-id")
            .arg(strategy_id.to_string())
            .kill_on_drop(true)
            .spawn()?;
        info!(%strategy_id, pid = child.id(), "worker spawned");
        self.children.insert(strategy_id, child);
        Ok(())
    }

    /// Detach a worker that was asked to stop gracefully: it gets `grace` to
    /// exit on its own before being killed, and its exit is not treated as a
    /// crash.
    pub fn release_worker(&mut self, strategy_id: StrategyId, grace: Duration) {
        self.pending_restarts
            .retain(|(pending, _)| *pending != strategy_id);
        self.trackers.remove(&strategy_id);
        let Some(mut child) = self.children.remove(&strategy_id) else {
            return;
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = tokio::time::sleep(grace) => {
                    warn!(%strategy_id, "worker ignored graceful stop; killing");
                    let _ = child.kill().await;
                }
            }
        });
    }

    /// Record a crash and either schedule a restart or give up.
    pub fn on_exit(&mut self, strategy_id: StrategyId) -> RestartDecision {
        let decision = self
            .trackers
            .entry(strategy_id)
            .or_default()
            .on_crash(Instant::now(), &self.config);
        if let RestartDecision::RestartAfter(delay) = decision {
            self.pending_restarts
                .push((strategy_id, Instant::now() + delay));
        }
        decision
    }

    /// Non-blocking sweep: collect exits and due restarts. Driven from the
    /// engine's supervision tick.
    pub fn poll(&mut self) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();

        let mut exited = Vec::new();
        for (strategy_id, child) in &mut self.children {
            if let Ok(Some(status)) = child.try_wait() {
                exited.push((*strategy_id, status));
            }
        }
        for (strategy_id, status) in exited {
            self.children.remove(&strategy_id);
            events.push(SupervisorEvent::Exited {
                strategy_id,
                status,
            });
        }

        let now = Instant::now();
        let mut due = Vec::new();
        self.pending_restarts.retain(|(strategy_id, at)| {
            if *at <= now {
                due.push(*strategy_id);
                false
            } else {
                true
            }
        });
        for strategy_id in due {
            events.push(SupervisorEvent::RestartDue { strategy_id });
        }

        events
    }
}
