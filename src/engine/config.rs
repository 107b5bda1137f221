use serde::{Deserialize, Serialize};

/// Engine tunables. Loadable from `vaultflow.yaml`, overridable via
/// `VAULTFLOW_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bounded tail length of each flow's event log.
    pub event_tail_limit: usize,
    /// Maximum nesting depth of branch-declared steps.
    pub max_branch_depth: usize,
    /// Period of the retry sweep re-entering paused-for-retry flows.
    pub retry_sweep_interval_s: f64,
    /// Cap on resumes the retry sweep keeps in flight at once.
    pub max_concurrent_resumes: usize,
    /// Cap on concurrently executing steps inside one flow.
    pub max_concurrent_steps: usize,
    /// Buffer size of the event bus broadcast channels.
    pub bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_tail_limit: 50,
            max_branch_depth: 4,
            retry_sweep_interval_s: 60.0,
            max_concurrent_resumes: num_cpus::get(),
            max_concurrent_steps: num_cpus::get(),
            bus_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Apply `VAULTFLOW_*` environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Self {
        fn read<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = read("VAULTFLOW_EVENT_TAIL_LIMIT") {
            self.event_tail_limit = v;
        }
        if let Some(v) = read("VAULTFLOW_MAX_BRANCH_DEPTH") {
            self.max_branch_depth = v;
        }
        if let Some(v) = read("VAULTFLOW_RETRY_SWEEP_INTERVAL_S") {
            self.retry_sweep_interval_s = v;
        }
        if let Some(v) = read("VAULTFLOW_MAX_CONCURRENT_RESUMES") {
            self.max_concurrent_resumes = v;
        }
        if let Some(v) = read("VAULTFLOW_MAX_CONCURRENT_STEPS") {
            self.max_concurrent_steps = v;
        }
        if let Some(v) = read("VAULTFLOW_BUS_CAPACITY") {
            self.bus_capacity = v;
        }
        self
    }
}
