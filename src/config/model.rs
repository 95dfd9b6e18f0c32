// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::dag::TaskSpec;
use crate::engine::{OrchestratorOptions, RunRequest};
use crate::exec::{CommandWorker, PoolOptions, WorkerRegistry};
use crate::knowledge::{AdvicePolicy, StaticAdvisor};
use crate::synth::SynthesisPolicy;
use crate::types::{NodeId, WorkerId};

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [engine]
/// concurrency = 2
/// timeout = "30s"
///
/// [synthesis]
/// coordinator = "architect"
/// node = "summary"
///
/// [advice]
/// mandatory = 0.90
/// suggested = 0.75
///
/// [[knowledge]]
/// pattern_id = "api-versioning"
/// confidence = 0.93
/// guidance = "Version every public endpoint."
/// applies_to = "backend|api"
///
/// [worker.backend]
/// cmd = "./workers/backend.sh"
///
/// [task.design]
/// worker = "architect"
/// description = "Design the service"
///
/// [task.api]
/// worker = "backend"
/// after = ["design"]
/// timeout = "2m"
/// ```
///
/// Only `[task.*]` is mandatory; everything else has defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub synthesis: SynthesisSection,

    #[serde(default)]
    pub advice: AdviceSection,

    #[serde(default)]
    pub knowledge: Vec<KnowledgeEntry>,

    /// Shell command per capability tag, from `[worker.<tag>]`.
    #[serde(default)]
    pub worker: BTreeMap<WorkerId, WorkerConfig>,

    /// All tasks from `[task.<id>]`.
    #[serde(default)]
    pub task: BTreeMap<NodeId, TaskConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Total worker calls per node.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_timeout")]
    pub timeout: String,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: String,

    /// Grace period for in-flight workers after a cancel.
    #[serde(default = "default_drain_grace")]
    pub drain_grace: String,

    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: usize,
}

fn default_concurrency() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout() -> String {
    "30s".to_string()
}

fn default_backoff_base() -> String {
    "100ms".to_string()
}

fn default_backoff_cap() -> String {
    "5s".to_string()
}

fn default_drain_grace() -> String {
    "5s".to_string()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".conductor/checkpoints")
}

fn default_keep_checkpoints() -> usize {
    2
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            timeout: default_timeout(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            drain_grace: default_drain_grace(),
            checkpoint_dir: default_checkpoint_dir(),
            keep_checkpoints: default_keep_checkpoints(),
        }
    }
}

/// `[synthesis]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynthesisSection {
    /// Worker whose writes win conflicts.
    #[serde(default)]
    pub coordinator: Option<WorkerId>,

    #[serde(default)]
    pub priority: Vec<WorkerId>,

    /// Node whose output is the final answer.
    #[serde(default)]
    pub node: Option<NodeId>,
}

/// `[advice]` section: confidence thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdviceSection {
    #[serde(default = "default_mandatory")]
    pub mandatory: f64,

    #[serde(default = "default_suggested")]
    pub suggested: f64,
}

fn default_mandatory() -> f64 {
    crate::knowledge::DEFAULT_MANDATORY
}

fn default_suggested() -> f64 {
    crate::knowledge::DEFAULT_SUGGESTED
}

impl Default for AdviceSection {
    fn default() -> Self {
        Self {
            mandatory: default_mandatory(),
            suggested: default_suggested(),
        }
    }
}

/// One `[[knowledge]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeEntry {
    pub pattern_id: String,
    pub confidence: f64,
    pub guidance: String,

    /// Regex over the worker tag and task description; all tasks if absent.
    #[serde(default)]
    pub applies_to: Option<String>,
}

/// `[worker.<tag>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub cmd: String,
}

/// `[task.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Capability tag of the worker that runs this task.
    pub worker: WorkerId,

    #[serde(default)]
    pub description: String,

    /// This task waits for all tasks listed here.
    #[serde(default)]
    pub after: Vec<NodeId>,

    /// Per-task timeout, e.g. `"2m"`.
    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub required: bool,
}

/// Engine settings after validation.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub pool: PoolOptions,
    pub checkpoint_dir: PathBuf,
    pub keep_checkpoints: usize,
}

/// Validated configuration.
///
/// Construct it with `ConfigFile::try_from(raw)`; see `validate.rs`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSettings,
    pub synthesis: SynthesisPolicy,
    pub synthesis_node: Option<NodeId>,
    pub advice: AdvicePolicy,
    pub advisor: StaticAdvisor,
    /// Shell command per capability tag.
    pub workers: BTreeMap<WorkerId, String>,
    /// Task specs, ordered by id.
    pub tasks: Vec<TaskSpec>,
}

impl ConfigFile {
    /// Command workers for every `[worker.<tag>]` entry.
    pub fn registry(&self) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for (tag, cmd) in &self.workers {
            registry.register(tag.clone(), std::sync::Arc::new(CommandWorker::new(cmd.clone())));
        }
        registry
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            pool: self.engine.pool,
            advice: self.advice,
            synthesis: self.synthesis.clone(),
        }
    }

    pub fn run_request(&self, description: impl Into<String>) -> RunRequest {
        RunRequest {
            description: description.into(),
            context: serde_json::Value::Null,
            tasks: self.tasks.clone(),
            synthesis: self.synthesis_node.clone(),
        }
    }
}
