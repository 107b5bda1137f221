use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::service::FlowEngine;
use crate::engine::types::{FlowStatus, StepStatus};

/// Background sweep re-entering paused-for-retry flows whose backoff has
/// elapsed. At most `max_concurrent_resumes` resumes run at once; further
/// eligible flows wait for the next tick.
pub struct RetrySweeper {
    engine: FlowEngine,
}

impl RetrySweeper {
    pub fn new(engine: FlowEngine) -> Self {
        Self { engine }
    }

    /// Spawn the periodic sweep loop. The task runs until aborted.
    pub fn spawn(engine: FlowEngine) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs_f64(engine.config().retry_sweep_interval_s);
        let sweeper = Self::new(engine);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweeper.sweep().await;
            }
        })
    }

    /// One pass: resume every eligible flow, bounded. Returns the number of
    /// flows successfully resumed.
    pub async fn sweep(&self) -> usize {
        let flows = match self.engine.store().list_non_terminal().await {
            Ok(flows) => flows,
            Err(e) => {
                warn!(error = %e, "Retry sweep could not scan the store");
                return 0;
            }
        };

        let now = Utc::now();
        let eligible: Vec<String> = flows
            .iter()
            .filter(|f| {
                f.status == FlowStatus::Paused
                    && f.steps.iter().any(|s| {
                        s.status == StepStatus::Paused
                            && s.resume_at.is_some_and(|at| at <= now)
                    })
            })
            .map(|f| f.flow_id.clone())
            .collect();

        if eligible.is_empty() {
            return 0;
        }

        let cap = self.engine.config().max_concurrent_resumes.max(1);
        let deferred = eligible.len().saturating_sub(cap);
        if deferred > 0 {
            debug!(deferred = deferred, "Retry sweep deferring flows to next tick");
        }

        let mut set = JoinSet::new();
        for flow_id in eligible.into_iter().take(cap) {
            let engine = self.engine.clone();
            set.spawn(async move {
                let result = engine.resume(&flow_id).await;
                (flow_id, result)
            });
        }

        let mut resumed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((flow_id, Ok(_))) => {
                    info!(flow_id = %flow_id, "Retry sweep resumed flow");
                    resumed += 1;
                }
                Ok((flow_id, Err(e))) => {
                    debug!(flow_id = %flow_id, error = %e, "Retry sweep skipped flow");
                }
                Err(e) => warn!(error = %e, "Retry sweep task failed"),
            }
        }
        resumed
    }
}
