// tests/config_validation.rs

mod common;
use crate::common::builders::{ConfigFileBuilder, TaskConfigBuilder};
use crate::common::init_tracing;

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use conductor::config::{load_and_validate, parse_str, ConfigFile};
use conductor::errors::{ConductorError, GraphValidationError};
use conductor::knowledge::{AdviceQuery, KnowledgeAdvisor};

type TestResult = Result<(), Box<dyn Error>>;

fn minimal() -> ConfigFileBuilder {
    ConfigFileBuilder::new()
        .with_worker("w", "true")
        .with_task("a", TaskConfigBuilder::new("w").build())
}

fn config_error(builder: ConfigFileBuilder) -> String {
    match ConfigFile::try_from(builder.raw()) {
        Err(ConductorError::ConfigError(msg)) => msg,
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[test]
fn demo_config_loads_and_validates() -> TestResult {
    init_tracing();

    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let cfg = load_and_validate(manifest.join("demos/feature-team.toml"))?;

    assert_eq!(cfg.engine.pool.concurrency, 2);
    assert_eq!(cfg.engine.pool.timeout, Duration::from_secs(30));
    assert_eq!(cfg.engine.pool.drain_grace, Duration::from_secs(2));
    assert_eq!(cfg.engine.pool.retry.max_attempts, 2);
    assert_eq!(cfg.engine.pool.retry.base, Duration::from_millis(50));
    assert_eq!(cfg.engine.pool.retry.cap, Duration::from_secs(1));
    assert_eq!(cfg.engine.keep_checkpoints, 3);

    assert_eq!(cfg.synthesis.coordinator.as_deref(), Some("architect"));
    assert_eq!(cfg.synthesis_node.as_deref(), Some("summary"));
    assert_eq!(cfg.advisor.len(), 3);

    let ids: Vec<&str> = cfg.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["api", "design", "summary", "ui"]);
    let api = &cfg.tasks[0];
    assert_eq!(api.after, vec!["design".to_string()]);
    assert_eq!(api.timeout, Some(Duration::from_secs(10)));
    assert!(cfg.tasks[1].required);
    assert_eq!(cfg.tasks[3].max_attempts, Some(1));

    assert_eq!(
        cfg.registry().tags(),
        vec!["architect", "backend", "frontend", "writer"]
    );
    Ok(())
}

#[test]
fn defaults_fill_every_optional_section() -> TestResult {
    let raw = parse_str(
        r#"
        [worker.w]
        cmd = "true"

        [task.only]
        worker = "w"
        "#,
    )?;
    let cfg = ConfigFile::try_from(raw)?;

    assert_eq!(cfg.engine.pool.concurrency, 2);
    assert_eq!(cfg.engine.pool.retry.max_attempts, 3);
    assert_eq!(cfg.engine.pool.timeout, Duration::from_secs(30));
    assert_eq!(cfg.engine.keep_checkpoints, 2);
    assert_eq!(cfg.advice.mandatory, 0.90);
    assert_eq!(cfg.advice.suggested, 0.75);
    assert!(cfg.synthesis.coordinator.is_none());
    assert!(cfg.advisor.is_empty());
    Ok(())
}

#[test]
fn unknown_keys_are_rejected_at_parse_time() {
    let err = parse_str(
        r#"
        [task.a]
        worker = "w"
        retries = 4
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, ConductorError::TomlError(_)));
}

#[test]
fn a_config_without_tasks_is_rejected() {
    let msg = config_error(ConfigFileBuilder::new().with_worker("w", "true"));
    assert!(msg.contains("at least one [task.<id>]"), "{msg}");
}

#[test]
fn engine_limits_must_be_positive() {
    let msg = config_error(minimal().engine(|e| e.concurrency = 0));
    assert!(msg.contains("concurrency"), "{msg}");

    let msg = config_error(minimal().engine(|e| e.max_attempts = 0));
    assert!(msg.contains("max_attempts"), "{msg}");

    let msg = config_error(minimal().engine(|e| e.keep_checkpoints = 0));
    assert!(msg.contains("keep_checkpoints"), "{msg}");

    let msg = config_error(minimal().engine(|e| e.timeout = "0s".into()));
    assert!(msg.contains("greater than zero"), "{msg}");
}

#[test]
fn durations_must_parse_and_backoff_must_be_ordered() {
    let msg = config_error(minimal().engine(|e| e.timeout = "soon".into()));
    assert!(msg.starts_with("[engine].timeout"), "{msg}");

    let msg = config_error(minimal().engine(|e| e.drain_grace = "5 fortnights".into()));
    assert!(msg.contains("unsupported duration unit"), "{msg}");

    let msg = config_error(minimal().engine(|e| {
        e.backoff_base = "10s".into();
        e.backoff_cap = "1s".into();
    }));
    assert!(msg.contains("exceeds backoff_cap"), "{msg}");

    let msg = config_error(
        minimal().with_task("b", TaskConfigBuilder::new("w").timeout("12").build()),
    );
    assert!(msg.starts_with("[task.b].timeout"), "{msg}");
}

#[test]
fn advice_thresholds_and_knowledge_are_checked() {
    let msg = config_error(minimal().advice(0.5, 0.8));
    assert!(msg.contains("below the suggested threshold"), "{msg}");

    let msg = config_error(minimal().advice(1.5, 0.8));
    assert!(msg.contains("within [0, 1]"), "{msg}");

    let msg = config_error(minimal().with_knowledge("k", 1.2, None));
    assert!(msg.contains("outside [0, 1]"), "{msg}");

    let msg = config_error(minimal().with_knowledge("k", 0.9, Some("(unclosed")));
    assert!(msg.contains("invalid applies_to regex"), "{msg}");
}

#[test]
fn workers_must_be_declared_and_non_empty() {
    let err = ConfigFile::try_from(
        minimal()
            .with_task("b", TaskConfigBuilder::new("ghost").build())
            .raw(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ConductorError::Graph(GraphValidationError::UnknownWorker { ref node, ref worker })
            if node == "b" && worker == "ghost"
    ));

    let msg = config_error(minimal().with_worker("empty", "   "));
    assert!(msg.contains("[worker.empty].cmd"), "{msg}");

    let msg = config_error(minimal().with_coordinator("boss"));
    assert!(msg.contains("coordinator 'boss'"), "{msg}");

    let msg = config_error(
        minimal().with_task("b", TaskConfigBuilder::new("w").max_attempts(0).build()),
    );
    assert!(msg.contains("[task.b].max_attempts"), "{msg}");
}

#[test]
fn graph_errors_surface_from_the_resolver() {
    let cyclic = minimal()
        .with_task("x", TaskConfigBuilder::new("w").after("y").build())
        .with_task("y", TaskConfigBuilder::new("w").after("x").build());
    let err = ConfigFile::try_from(cyclic.raw()).unwrap_err();
    assert!(matches!(
        err,
        ConductorError::Graph(GraphValidationError::Cycle { ref nodes })
            if nodes == &vec!["x".to_string(), "y".to_string()]
    ));

    let dangling = minimal().with_task("b", TaskConfigBuilder::new("w").after("nowhere").build());
    assert!(matches!(
        ConfigFile::try_from(dangling.raw()).unwrap_err(),
        ConductorError::Graph(GraphValidationError::DanglingDependency { .. })
    ));

    let bad_synthesis = minimal().with_synthesis_node("nowhere");
    assert!(matches!(
        ConfigFile::try_from(bad_synthesis.raw()).unwrap_err(),
        ConductorError::Graph(GraphValidationError::UnknownSynthesisNode(_))
    ));
}

#[test]
fn validated_config_feeds_the_orchestrator() {
    let cfg = minimal()
        .with_worker("v", "true")
        .with_task(
            "b",
            TaskConfigBuilder::new("v")
                .after("a")
                .description("second")
                .required(true)
                .build(),
        )
        .with_coordinator("v")
        .with_synthesis_node("b")
        .engine(|e| e.concurrency = 4)
        .build();

    let request = cfg.run_request("ship it");
    assert_eq!(request.description, "ship it");
    assert_eq!(request.synthesis.as_deref(), Some("b"));
    assert_eq!(request.tasks.len(), 2);

    let options = cfg.orchestrator_options();
    assert_eq!(options.pool.concurrency, 4);
    assert_eq!(options.synthesis.coordinator.as_deref(), Some("v"));

    assert_eq!(cfg.registry().tags(), vec!["v", "w"]);
}

#[test]
fn knowledge_entries_become_a_static_advisor() -> TestResult {
    let raw = parse_str(
        r#"
        [[knowledge]]
        pattern_id = "general"
        confidence = 0.8
        guidance = "applies everywhere"

        [[knowledge]]
        pattern_id = "backend-only"
        confidence = 0.95
        guidance = "only for backend"
        applies_to = "^backend$"

        [worker.backend]
        cmd = "true"

        [worker.frontend]
        cmd = "true"

        [task.api]
        worker = "backend"

        [task.ui]
        worker = "frontend"
        "#,
    )?;
    let cfg = ConfigFile::try_from(raw)?;

    let query = |worker: &str| AdviceQuery {
        node: "n".into(),
        worker: worker.into(),
        description: "some work".into(),
    };
    let ids = |worker: &str| -> Vec<String> {
        cfg.advisor
            .query(&query(worker))
            .into_iter()
            .map(|a| a.pattern_id)
            .collect()
    };

    assert_eq!(ids("backend"), vec!["backend-only", "general"]);
    assert_eq!(ids("frontend"), vec!["general"]);
    Ok(())
}
