pub mod condition;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::context::DataMap;
use crate::engine::errors::{EngineError, EngineResult};
use crate::engine::types::{BranchOwner, StepInstance, StepMetadata, StepOutcome};

/// Input handed to a step execution.
pub struct StepInput {
    pub flow_id: String,
    pub flow_type: String,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Read-consistent view of the data context captured at launch.
    pub data: DataMap,
    /// Flips to true when the flow is being cancelled. Honoring it is
    /// advisory; the scheduler cancels the flow once the step returns.
    pub cancel: watch::Receiver<bool>,
}

impl StepInput {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// A step definition: static metadata plus a pure execution contract.
///
/// The returned metadata must be deterministic and stable across process
/// lifetimes — step names are the only durable identity restore has.
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn describe(&self) -> StepMetadata;

    async fn execute(&self, input: StepInput) -> Result<StepOutcome>;
}

impl std::fmt::Debug for dyn StepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.describe().fmt(f)
    }
}

struct FlowTypeEntry {
    handlers: Vec<Arc<dyn StepHandler>>,
    fingerprint: String,
}

/// Process-wide registry of step definitions keyed by flow type.
///
/// Read-only after registration; registering a new flow type later is fine,
/// redefining an existing one is not.
pub struct StepCatalog {
    flows: RwLock<HashMap<String, FlowTypeEntry>>,
    max_branch_depth: usize,
}

impl StepCatalog {
    pub fn new(max_branch_depth: usize) -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            max_branch_depth,
        }
    }

    /// Register the definition pool for a flow type.
    ///
    /// Idempotent: re-registering with an identical metadata fingerprint is
    /// a no-op; a different fingerprint fails with `DuplicateRegistration`.
    pub fn register(
        &self,
        flow_type: impl Into<String>,
        handlers: Vec<Arc<dyn StepHandler>>,
    ) -> EngineResult<()> {
        let flow_type = flow_type.into();
        let metadata: Vec<StepMetadata> = handlers.iter().map(|h| h.describe()).collect();
        self.validate_structure(&flow_type, &metadata)?;
        let fingerprint = fingerprint(&metadata)?;

        let mut flows = self.flows.write().unwrap();
        if let Some(existing) = flows.get(&flow_type) {
            if existing.fingerprint == fingerprint {
                return Ok(());
            }
            return Err(EngineError::DuplicateRegistration(flow_type));
        }
        flows.insert(
            flow_type,
            FlowTypeEntry {
                handlers,
                fingerprint,
            },
        );
        Ok(())
    }

    pub fn contains(&self, flow_type: &str) -> bool {
        self.flows.read().unwrap().contains_key(flow_type)
    }

    pub fn flow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.flows.read().unwrap().keys().cloned().collect();
        types.sort();
        types
    }

    /// The deterministic definition sequence for a flow type.
    pub fn resolve(&self, flow_type: &str) -> EngineResult<Vec<Arc<dyn StepHandler>>> {
        self.flows
            .read()
            .unwrap()
            .get(flow_type)
            .map(|e| e.handlers.clone())
            .ok_or_else(|| EngineError::UnknownFlowType(flow_type.to_string()))
    }

    pub fn metadata(&self, flow_type: &str) -> EngineResult<Vec<StepMetadata>> {
        Ok(self
            .resolve(flow_type)?
            .iter()
            .map(|h| h.describe())
            .collect())
    }

    /// Look up one handler by step name.
    pub fn handler(&self, flow_type: &str, step_name: &str) -> EngineResult<Arc<dyn StepHandler>> {
        self.resolve(flow_type)?
            .into_iter()
            .find(|h| h.describe().name == step_name)
            .ok_or_else(|| EngineError::CatalogDrift(step_name.to_string()))
    }

    /// Build the full step instance pool for a new flow: every definition,
    /// branch-scoped ones included, in catalog order. Branch-scoped steps
    /// are tagged with their owning `(step, branch)` and gated until that
    /// branch is selected.
    pub fn instantiate(&self, flow_type: &str) -> EngineResult<Vec<StepInstance>> {
        let metadata = self.metadata(flow_type)?;
        let owners = branch_owners(&metadata);
        Ok(metadata
            .into_iter()
            .enumerate()
            .map(|(index, meta)| {
                let branch_of = owners.get(&meta.name).cloned();
                StepInstance::from_metadata(meta, index, branch_of)
            })
            .collect())
    }

    /// Graph checks deferred to flow start: unknown dependency names and
    /// dependency cycles. A violation fails the flow, not the registration.
    pub fn validate_graph(&self, flow_type: &str) -> EngineResult<Result<(), String>> {
        let metadata = self.metadata(flow_type)?;
        Ok(validate_dependencies(&metadata))
    }

    /// Structural checks applied at registration time.
    fn validate_structure(&self, flow_type: &str, metadata: &[StepMetadata]) -> EngineResult<()> {
        if metadata.is_empty() {
            return Err(EngineError::Internal(format!(
                "flow type '{}' has no step definitions",
                flow_type
            )));
        }

        let mut names = HashSet::new();
        for meta in metadata {
            if meta.name.is_empty() {
                return Err(EngineError::Internal(format!(
                    "flow type '{}' contains a step with an empty name",
                    flow_type
                )));
            }
            if !names.insert(meta.name.as_str()) {
                return Err(EngineError::Internal(format!(
                    "duplicate step name '{}' in flow type '{}'",
                    meta.name, flow_type
                )));
            }
        }

        // Every branch-referenced step must exist and belong to exactly one branch.
        let mut owned: HashMap<&str, (&str, &str)> = HashMap::new();
        for meta in metadata {
            for branch in &meta.branches {
                for step in &branch.steps {
                    if !names.contains(step.as_str()) {
                        return Err(EngineError::Internal(format!(
                            "branch '{}' of step '{}' references unknown step '{}'",
                            branch.name, meta.name, step
                        )));
                    }
                    if let Some((other_step, other_branch)) =
                        owned.insert(step.as_str(), (meta.name.as_str(), branch.name.as_str()))
                    {
                        return Err(EngineError::Internal(format!(
                            "step '{}' is claimed by branch '{}' of '{}' and branch '{}' of '{}'",
                            step, other_branch, other_step, branch.name, meta.name
                        )));
                    }
                }
            }
        }

        // Nested branching is allowed up to the configured depth.
        let by_name: HashMap<&str, &StepMetadata> =
            metadata.iter().map(|m| (m.name.as_str(), m)).collect();
        for meta in metadata {
            let depth = branch_depth(meta, &by_name, 0, self.max_branch_depth + 1);
            if depth > self.max_branch_depth {
                return Err(EngineError::BranchNestingExceeded {
                    step: meta.name.clone(),
                    max: self.max_branch_depth,
                });
            }
        }

        Ok(())
    }
}

/// Map each branch-scoped step name to its owning `(step, branch)`.
fn branch_owners(metadata: &[StepMetadata]) -> HashMap<String, BranchOwner> {
    let mut owners = HashMap::new();
    for meta in metadata {
        for branch in &meta.branches {
            for step in &branch.steps {
                owners.insert(
                    step.clone(),
                    BranchOwner {
                        step: meta.name.clone(),
                        branch: branch.name.clone(),
                    },
                );
            }
        }
    }
    owners
}

/// Depth of the branch tree rooted at `meta`, saturating at `cap` so that
/// accidental cycles terminate.
fn branch_depth(
    meta: &StepMetadata,
    by_name: &HashMap<&str, &StepMetadata>,
    depth: usize,
    cap: usize,
) -> usize {
    if meta.branches.is_empty() || depth >= cap {
        return depth;
    }
    let mut max = depth;
    for branch in &meta.branches {
        for step in &branch.steps {
            if let Some(child) = by_name.get(step.as_str()) {
                max = max.max(branch_depth(child, by_name, depth + 1, cap));
            }
        }
    }
    max
}

/// Kahn's algorithm over the declared dependencies: rejects unknown names
/// and cycles.
fn validate_dependencies(metadata: &[StepMetadata]) -> Result<(), String> {
    let names: HashSet<&str> = metadata.iter().map(|m| m.name.as_str()).collect();

    for meta in metadata {
        for dep in &meta.step_dependencies {
            if !names.contains(dep.as_str()) {
                return Err(format!(
                    "step '{}' depends on '{}', which does not exist",
                    meta.name, dep
                ));
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for meta in metadata {
        in_degree.entry(meta.name.as_str()).or_insert(0);
        for dep in &meta.step_dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(meta.name.as_str());
            *in_degree.entry(meta.name.as_str()).or_insert(0) += 1;
        }
    }

    let mut remaining: HashSet<&str> = names.clone();
    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|name| in_degree.get(*name).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        if ready.is_empty() {
            if remaining.is_empty() {
                return Ok(());
            }
            let mut stuck: Vec<&str> = remaining.into_iter().collect();
            stuck.sort();
            return Err(format!("dependency cycle among steps: {}", stuck.join(", ")));
        }

        for name in ready {
            remaining.remove(name);
            if let Some(deps) = dependents.get(name) {
                for dep in deps {
                    if let Some(deg) = in_degree.get_mut(dep) {
                        *deg -= 1;
                    }
                }
            }
        }
    }
}

/// Stable fingerprint of a metadata sequence, for registration idempotence.
fn fingerprint(metadata: &[StepMetadata]) -> EngineResult<String> {
    let canonical = serde_json::to_vec(metadata)
        .map_err(|e| EngineError::Internal(format!("unserializable step metadata: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}
