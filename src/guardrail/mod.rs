//! Pre-execution guardrail — text in, decision out.
//!
//! Screens untrusted natural-language requests before any execution
//! capability is granted. Two stages compose into a staged decision:
//!
//! 1. Pattern matching (cheap, deterministic, never bypassed)
//! 2. AI classification (narrows ambiguous cases, bounded by a timeout)
//!
//! The guardrail is fail-open: when the AI stage is disabled or produces
//! no verdict, the analyzer falls back to the pattern-only outcome rather
//! than stalling the pipeline. Denial of service through classifier
//! failure is judged worse than an occasional false approval for this
//! threat model.

pub mod classifier;
pub mod patterns;

use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::GuardrailConfig;
use classifier::{AiClassifier, AnthropicClassifier};
use patterns::{ThreatPatternMatcher, SAFE_PRECHECK_CONFIDENCE};

/// Confidence reported when a sub-threshold pattern signal is overridden
const OVERRIDE_CONFIDENCE: f64 = 0.5;

/// Confidence reported when nothing matched at all
const NO_THREAT_CONFIDENCE: f64 = 0.7;

/// Outcome of the guardrail analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Approved,
    Blocked,
    Escalate,
}

/// Threat taxonomy shared by the pattern catalog and the AI classifier.
/// `Unclear` and `Other` are only ever produced by the AI stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatCategory {
    DestructiveAction,
    PromptInjection,
    CompetenceExceeded,
    FinancialRisk,
    SecurityRisk,
    Unclear,
    Other,
}

impl ThreatCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreatCategory::DestructiveAction => "destructive-action",
            ThreatCategory::PromptInjection => "prompt-injection",
            ThreatCategory::CompetenceExceeded => "competence-exceeded",
            ThreatCategory::FinancialRisk => "financial-risk",
            ThreatCategory::SecurityRisk => "security-risk",
            ThreatCategory::Unclear => "unclear",
            ThreatCategory::Other => "other",
        }
    }

    /// Parses the wire form used by the classifier (kebab or snake case).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "destructive-action" => Some(ThreatCategory::DestructiveAction),
            "prompt-injection" => Some(ThreatCategory::PromptInjection),
            "competence-exceeded" => Some(ThreatCategory::CompetenceExceeded),
            "financial-risk" => Some(ThreatCategory::FinancialRisk),
            "security-risk" => Some(ThreatCategory::SecurityRisk),
            "unclear" => Some(ThreatCategory::Unclear),
            "other" => Some(ThreatCategory::Other),
            _ => None,
        }
    }
}

/// Which stage(s) produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMethod {
    /// Pattern stage alone decided
    Pattern,
    /// AI decided with no pattern signal at all
    Ai,
    /// A sub-threshold pattern raised suspicion, AI adjudicated
    Hybrid,
}

/// The guardrail's answer for one request.
#[derive(Debug, Clone, Serialize)]
pub struct GuardrailResult {
    pub decision: Decision,
    pub reason: Option<ThreatCategory>,
    pub explanation: String,
    pub confidence: f64,
    pub method: AnalysisMethod,
    pub duration_ms: u64,
}

impl GuardrailResult {
    pub fn is_approved(&self) -> bool {
        self.decision == Decision::Approved
    }
}

/// Composes the pattern matcher and the optional AI classifier into the
/// staged decision protocol.
pub struct GuardrailAnalyzer {
    patterns: ThreatPatternMatcher,
    classifier: Option<Box<dyn AiClassifier>>,
    block_threshold: f64,
}

impl GuardrailAnalyzer {
    pub fn new(config: &GuardrailConfig) -> Result<Self> {
        let classifier: Option<Box<dyn AiClassifier>> = if config.ai_enabled {
            Some(Box::new(AnthropicClassifier::new(config.clone())))
        } else {
            None
        };
        Self::with_classifier(config, classifier)
    }

    /// Constructor with an explicit classifier (or none). Used directly
    /// by tests; `new()` delegates here.
    pub fn with_classifier(
        config: &GuardrailConfig,
        classifier: Option<Box<dyn AiClassifier>>,
    ) -> Result<Self> {
        Ok(Self {
            patterns: ThreatPatternMatcher::new()?,
            classifier,
            block_threshold: config.block_threshold,
        })
    }

    /// Runs the staged decision protocol, short-circuiting on the first
    /// conclusive signal. `duration_ms` covers whichever stages ran.
    pub async fn analyze(&self, text: &str) -> GuardrailResult {
        let started = Instant::now();

        // Stage 1: obviously-safe pre-check, no catalog run
        if self.patterns.is_obviously_safe(text) {
            debug!("Guardrail: safe pre-check fired");
            return GuardrailResult {
                decision: Decision::Approved,
                reason: None,
                explanation: "obviously safe request (greeting, question or lookup)"
                    .to_string(),
                confidence: SAFE_PRECHECK_CONFIDENCE,
                method: AnalysisMethod::Pattern,
                duration_ms: elapsed_ms(started),
            };
        }

        // Stage 2: full catalog; authoritative at high confidence
        let matched = self.patterns.find_match(text);
        if let Some(ref m) = matched {
            if m.confidence >= self.block_threshold {
                info!(
                    "Guardrail: blocked by pattern ({}, {:.2})",
                    m.category.as_str(),
                    m.confidence
                );
                return GuardrailResult {
                    decision: Decision::Blocked,
                    reason: Some(m.category),
                    explanation: format!("matched threat pattern: {}", m.rule),
                    confidence: m.confidence,
                    method: AnalysisMethod::Pattern,
                    duration_ms: elapsed_ms(started),
                };
            }
        }

        // Stage 3: AI adjudication of the ambiguous middle
        if let Some(classifier) = &self.classifier {
            if let Some(verdict) = classifier.classify(text).await {
                let method = if matched.is_some() {
                    AnalysisMethod::Hybrid
                } else {
                    AnalysisMethod::Ai
                };
                info!(
                    "Guardrail: AI verdict {:?} ({:.2}, {:?})",
                    verdict.decision, verdict.confidence, method
                );
                return GuardrailResult {
                    decision: verdict.decision,
                    reason: verdict.reason,
                    explanation: verdict.explanation,
                    confidence: verdict.confidence,
                    method,
                    duration_ms: elapsed_ms(started),
                };
            }
        }

        // Stage 4: fail-open fallback (AI disabled or no verdict)
        let result = match matched {
            Some(m) => GuardrailResult {
                decision: Decision::Approved,
                reason: Some(m.category),
                explanation: format!(
                    "sub-threshold pattern signal ({}, {:.2}) overridden without AI adjudication",
                    m.category.as_str(),
                    m.confidence
                ),
                confidence: OVERRIDE_CONFIDENCE,
                method: AnalysisMethod::Pattern,
                duration_ms: elapsed_ms(started),
            },
            None => GuardrailResult {
                decision: Decision::Approved,
                reason: None,
                explanation: "no threat detected".to_string(),
                confidence: NO_THREAT_CONFIDENCE,
                method: AnalysisMethod::Pattern,
                duration_ms: elapsed_ms(started),
            },
        };
        debug!(
            "Guardrail: fallback approval ({:.2})",
            result.confidence
        );
        result
    }

    /// Human-readable summary for startup logs.
    pub fn description(&self) -> String {
        match &self.classifier {
            Some(c) => format!("pattern + {}", c.description()),
            None => "pattern only".to_string(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
