#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use conductor::checkpoint::{CheckpointManager, InMemoryCheckpointStore};
use conductor::config::model::{
    AdviceSection, EngineSection, KnowledgeEntry, SynthesisSection, WorkerConfig,
};
use conductor::config::{ConfigFile, RawConfigFile, TaskConfig};
use conductor::dag::TaskSpec;
use conductor::engine::{Orchestrator, OrchestratorOptions};
use conductor::exec::{PoolOptions, RetryPolicy, WorkerRegistry};

/// Builder for `RawConfigFile` / `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                engine: EngineSection::default(),
                synthesis: SynthesisSection::default(),
                advice: AdviceSection::default(),
                knowledge: Vec::new(),
                worker: BTreeMap::new(),
                task: BTreeMap::new(),
            },
        }
    }

    pub fn with_worker(mut self, tag: &str, cmd: &str) -> Self {
        self.config.worker.insert(
            tag.to_string(),
            WorkerConfig {
                cmd: cmd.to_string(),
            },
        );
        self
    }

    pub fn with_task(mut self, id: &str, task: TaskConfig) -> Self {
        self.config.task.insert(id.to_string(), task);
        self
    }

    pub fn with_knowledge(mut self, pattern_id: &str, confidence: f64, applies_to: Option<&str>) -> Self {
        self.config.knowledge.push(KnowledgeEntry {
            pattern_id: pattern_id.to_string(),
            confidence,
            guidance: format!("guidance for {pattern_id}"),
            applies_to: applies_to.map(str::to_string),
        });
        self
    }

    pub fn with_coordinator(mut self, worker: &str) -> Self {
        self.config.synthesis.coordinator = Some(worker.to_string());
        self
    }

    pub fn with_synthesis_node(mut self, node: &str) -> Self {
        self.config.synthesis.node = Some(node.to_string());
        self
    }

    pub fn engine(mut self, f: impl FnOnce(&mut EngineSection)) -> Self {
        f(&mut self.config.engine);
        self
    }

    pub fn advice(mut self, mandatory: f64, suggested: f64) -> Self {
        self.config.advice = AdviceSection {
            mandatory,
            suggested,
        };
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(worker: &str) -> Self {
        Self {
            task: TaskConfig {
                worker: worker.to_string(),
                description: String::new(),
                after: vec![],
                timeout: None,
                max_attempts: None,
                required: false,
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.task.description = text.to_string();
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.task.timeout = Some(duration.to_string());
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.task.max_attempts = Some(attempts);
        self
    }

    pub fn required(mut self, val: bool) -> Self {
        self.task.required = val;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// `A -> {B, C} -> D`, every node on worker tag `w`.
pub fn diamond() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("A", "w", "root"),
        TaskSpec::new("B", "w", "left").after("A"),
        TaskSpec::new("C", "w", "right").after("A"),
        TaskSpec::new("D", "w", "join").after("B").after("C"),
    ]
}

/// `n0 -> n1 -> ... -> n(len-1)` on worker tag `w`.
pub fn chain(len: usize) -> Vec<TaskSpec> {
    (0..len)
        .map(|i| {
            let spec = TaskSpec::new(format!("n{i}"), "w", format!("step {i}"));
            if i == 0 {
                spec
            } else {
                spec.after(format!("n{}", i - 1))
            }
        })
        .collect()
}

/// Pool options with millisecond backoff so retry tests stay fast.
pub fn fast_pool(concurrency: usize) -> PoolOptions {
    PoolOptions {
        concurrency,
        timeout: Duration::from_secs(2),
        drain_grace: Duration::from_millis(500),
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10)),
    }
}

/// Orchestrator over an in-memory checkpoint store that keeps every
/// checkpoint. The store handle is returned for inspection.
pub fn memory_orchestrator(
    registry: WorkerRegistry,
    options: OrchestratorOptions,
) -> (Orchestrator, InMemoryCheckpointStore) {
    let store = InMemoryCheckpointStore::new();
    let orchestrator = orchestrator_on(store.clone(), registry, options);
    (orchestrator, store)
}

/// Orchestrator over an existing in-memory store.
pub fn orchestrator_on(
    store: InMemoryCheckpointStore,
    registry: WorkerRegistry,
    options: OrchestratorOptions,
) -> Orchestrator {
    let checkpoints = CheckpointManager::new(Arc::new(store)).with_keep(usize::MAX);
    Orchestrator::new(registry, checkpoints, options)
}

/// Options with [`fast_pool`] and otherwise defaults.
pub fn fast_options(concurrency: usize) -> OrchestratorOptions {
    OrchestratorOptions {
        pool: fast_pool(concurrency),
        ..OrchestratorOptions::default()
    }
}
