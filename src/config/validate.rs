// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;

use crate::config::model::{
    ConfigFile, EngineSection, EngineSettings, KnowledgeEntry, RawConfigFile, TaskConfig,
};
use crate::dag::{resolver, TaskSpec};
use crate::errors::{ConductorError, GraphValidationError, Result};
use crate::exec::{PoolOptions, RetryPolicy};
use crate::knowledge::{AdvicePolicy, KnowledgeAdvice, StaticAdvisor};
use crate::synth::SynthesisPolicy;
use crate::types::parse_duration;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = ConductorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_tasks(&raw)?;
        let engine = validate_engine(&raw.engine)?;
        let advice = AdvicePolicy::new(raw.advice.mandatory, raw.advice.suggested)?;
        let advisor = build_advisor(&raw.knowledge)?;
        validate_workers(&raw)?;
        let tasks = build_tasks(&raw.task)?;

        // Runs the full graph validation; the graph itself is rebuilt per run.
        resolver::build(tasks.clone(), raw.synthesis.node.clone())?;

        Ok(ConfigFile {
            engine,
            synthesis: SynthesisPolicy {
                coordinator: raw.synthesis.coordinator,
                priority: raw.synthesis.priority,
            },
            synthesis_node: raw.synthesis.node,
            advice,
            advisor,
            workers: raw
                .worker
                .into_iter()
                .map(|(tag, w)| (tag, w.cmd))
                .collect(),
            tasks,
        })
    }
}

fn config_err(msg: impl Into<String>) -> ConductorError {
    ConductorError::ConfigError(msg.into())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(config_err(
            "config must contain at least one [task.<id>] section",
        ));
    }
    Ok(())
}

fn duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_err(format!("{field}: {e}")))
}

fn validate_engine(engine: &EngineSection) -> Result<EngineSettings> {
    if engine.concurrency == 0 {
        return Err(config_err("[engine].concurrency must be >= 1 (got 0)"));
    }
    if engine.max_attempts == 0 {
        return Err(config_err("[engine].max_attempts must be >= 1 (got 0)"));
    }
    if engine.keep_checkpoints == 0 {
        return Err(config_err("[engine].keep_checkpoints must be >= 1 (got 0)"));
    }

    let timeout = duration("[engine].timeout", &engine.timeout)?;
    if timeout.is_zero() {
        return Err(config_err("[engine].timeout must be greater than zero"));
    }
    let base = duration("[engine].backoff_base", &engine.backoff_base)?;
    let cap = duration("[engine].backoff_cap", &engine.backoff_cap)?;
    if base > cap {
        return Err(config_err(format!(
            "[engine].backoff_base ({}) exceeds backoff_cap ({})",
            engine.backoff_base, engine.backoff_cap
        )));
    }
    let drain_grace = duration("[engine].drain_grace", &engine.drain_grace)?;

    Ok(EngineSettings {
        pool: PoolOptions {
            concurrency: engine.concurrency,
            timeout,
            drain_grace,
            retry: RetryPolicy::new(engine.max_attempts, base, cap),
        },
        checkpoint_dir: engine.checkpoint_dir.clone(),
        keep_checkpoints: engine.keep_checkpoints,
    })
}

fn build_advisor(entries: &[KnowledgeEntry]) -> Result<StaticAdvisor> {
    let mut advisor = StaticAdvisor::new();
    for entry in entries {
        if !(0.0..=1.0).contains(&entry.confidence) {
            return Err(config_err(format!(
                "knowledge '{}': confidence {} is outside [0, 1]",
                entry.pattern_id, entry.confidence
            )));
        }
        let applies_to = entry
            .applies_to
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                config_err(format!(
                    "knowledge '{}': invalid applies_to regex: {e}",
                    entry.pattern_id
                ))
            })?;
        advisor = advisor.with_entry(
            KnowledgeAdvice {
                pattern_id: entry.pattern_id.clone(),
                confidence: entry.confidence,
                guidance: entry.guidance.clone(),
            },
            applies_to,
        );
    }
    Ok(advisor)
}

fn validate_workers(cfg: &RawConfigFile) -> Result<()> {
    for (id, task) in &cfg.task {
        if !cfg.worker.contains_key(&task.worker) {
            return Err(GraphValidationError::UnknownWorker {
                node: id.clone(),
                worker: task.worker.clone(),
            }
            .into());
        }
    }
    for (tag, worker) in &cfg.worker {
        if worker.cmd.trim().is_empty() {
            return Err(config_err(format!("[worker.{tag}].cmd must not be empty")));
        }
    }
    if let Some(coordinator) = &cfg.synthesis.coordinator {
        if !cfg.worker.contains_key(coordinator) {
            return Err(config_err(format!(
                "[synthesis].coordinator '{coordinator}' is not a declared worker"
            )));
        }
    }
    Ok(())
}

fn build_tasks(tasks: &BTreeMap<String, TaskConfig>) -> Result<Vec<TaskSpec>> {
    tasks
        .iter()
        .map(|(id, task)| {
            let timeout = task
                .timeout
                .as_deref()
                .map(|t| duration(&format!("[task.{id}].timeout"), t))
                .transpose()?;
            if task.max_attempts == Some(0) {
                return Err(config_err(format!(
                    "[task.{id}].max_attempts must be >= 1 (got 0)"
                )));
            }
            Ok(TaskSpec {
                id: id.clone(),
                worker: task.worker.clone(),
                description: task.description.clone(),
                after: task.after.clone(),
                timeout,
                max_attempts: task.max_attempts,
                required: task.required,
            })
        })
        .collect()
}
