// src/knowledge.rs

//! Knowledge advice: read-only hints passed through to workers.
//!
//! The advisor is queried once when a node is dispatched. Its answer is a
//! snapshot; nothing the run does feeds back into it.

use std::fmt::Debug;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ConductorError;
use crate::types::{NodeId, WorkerId};

pub const DEFAULT_MANDATORY: f64 = 0.90;
pub const DEFAULT_SUGGESTED: f64 = 0.75;

/// One piece of advice as returned by an advisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeAdvice {
    pub pattern_id: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub guidance: String,
}

/// What the advisor is asked about.
#[derive(Debug, Clone, PartialEq)]
pub struct AdviceQuery {
    pub node: NodeId,
    pub worker: WorkerId,
    pub description: String,
}

pub trait KnowledgeAdvisor: Send + Sync + Debug {
    /// Advice relevant to `query`, most relevant first.
    fn query(&self, query: &AdviceQuery) -> Vec<KnowledgeAdvice>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdviceTier {
    Mandatory,
    Suggested,
}

/// Advice as forwarded to a worker, tagged with its tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedAdvice {
    pub tier: AdviceTier,
    #[serde(flatten)]
    pub advice: KnowledgeAdvice,
}

/// Confidence thresholds deciding what reaches a worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvicePolicy {
    pub mandatory: f64,
    pub suggested: f64,
}

impl Default for AdvicePolicy {
    fn default() -> Self {
        Self {
            mandatory: DEFAULT_MANDATORY,
            suggested: DEFAULT_SUGGESTED,
        }
    }
}

impl AdvicePolicy {
    pub fn new(mandatory: f64, suggested: f64) -> Result<Self, ConductorError> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(mandatory) || !in_range(suggested) {
            return Err(ConductorError::ConfigError(format!(
                "advice thresholds must be within [0, 1] (mandatory={mandatory}, suggested={suggested})"
            )));
        }
        if mandatory < suggested {
            return Err(ConductorError::ConfigError(format!(
                "mandatory advice threshold {mandatory} is below the suggested threshold {suggested}"
            )));
        }
        Ok(Self {
            mandatory,
            suggested,
        })
    }

    pub fn classify(&self, confidence: f64) -> Option<AdviceTier> {
        if confidence >= self.mandatory {
            Some(AdviceTier::Mandatory)
        } else if confidence >= self.suggested {
            Some(AdviceTier::Suggested)
        } else {
            None
        }
    }

    /// Drop advice below the suggested threshold, keeping the advisor's order.
    pub fn apply(&self, advice: Vec<KnowledgeAdvice>) -> Vec<ForwardedAdvice> {
        advice
            .into_iter()
            .filter_map(|advice| {
                let tier = self.classify(advice.confidence)?;
                Some(ForwardedAdvice { tier, advice })
            })
            .collect()
    }
}

/// Advisor that never has anything to say.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdvice;

impl KnowledgeAdvisor for NoAdvice {
    fn query(&self, _query: &AdviceQuery) -> Vec<KnowledgeAdvice> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
struct StaticEntry {
    advice: KnowledgeAdvice,
    applies_to: Option<Regex>,
}

/// Fixed advice list; each entry optionally limited by a regex matched
/// against the worker tag and the task description.
#[derive(Debug, Clone, Default)]
pub struct StaticAdvisor {
    entries: Vec<StaticEntry>,
}

impl StaticAdvisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, advice: KnowledgeAdvice, applies_to: Option<Regex>) -> Self {
        self.entries.push(StaticEntry { advice, applies_to });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KnowledgeAdvisor for StaticAdvisor {
    fn query(&self, query: &AdviceQuery) -> Vec<KnowledgeAdvice> {
        let mut matched: Vec<KnowledgeAdvice> = self
            .entries
            .iter()
            .filter(|e| match &e.applies_to {
                Some(re) => re.is_match(&query.worker) || re.is_match(&query.description),
                None => true,
            })
            .map(|e| e.advice.clone())
            .collect();
        matched.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        matched
    }
}
