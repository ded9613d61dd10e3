//! Two-layer anomaly detection.
//!
//! Layer 1 ([`DeterministicDetector`]) is rule-based, synchronous and provider-free: the same text always
//! yields the same score, emotion and findings. Layer 2 ([`SemanticDetector`]) asks the model for an
//! advisory accuracy/risk review and only runs for content Layer 1 held as borderline.

mod deterministic;
mod emotion;
mod semantic;

pub use deterministic::DeterministicDetector;
pub use emotion::{read_emotion, EmotionReading};
pub use semantic::{parse_review, SemanticDetector, SemanticError, SemanticReview};

use serde::{Deserialize, Serialize};

use crate::shared::{Emotion, Finding, Intensity, Role, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionContext {
    pub role: Role,
}

impl DetectionContext {
    pub fn user() -> Self {
        Self { role: Role::User }
    }

    pub fn assistant() -> Self {
        Self { role: Role::Assistant }
    }
}

/// Layer-1 escalation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Nothing found.
    Allow,
    /// Low-risk findings: shown with a warning flag, no review case.
    Warn,
    /// Borderline: withheld and sent for semantic and human review.
    Hold,
    /// Conclusive: withheld and blocked at once; still opened for human confirmation.
    Block,
}

impl Verdict {
    #[inline]
    pub fn escalates(&self) -> bool {
        matches!(self, Verdict::Hold | Verdict::Block)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub safety_score: u8,
    pub emotion: Emotion,
    pub intensity: Intensity,
    pub findings: Vec<Finding>,
    pub verdict: Verdict,
}

impl DetectionReport {
    /// Report used when the scan itself failed. Fails closed.
    pub fn fail_closed(err: &DetectionError) -> Self {
        Self {
            safety_score: 0,
            emotion: Emotion::Neutral,
            intensity: Intensity::Low,
            findings: vec![Finding::ScanFailure { reason: err.to_string() }],
            verdict: Verdict::Block,
        }
    }

    /// Finding with the highest severity; ties keep detection order.
    pub fn primary_finding(&self) -> Option<&Finding> {
        self.findings.iter().reduce(|best, f| if f.severity() > best.severity() { f } else { best })
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(Finding::severity).max()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("text of {len} bytes exceeds the scan limit of {limit} bytes")]
    InputTooLarge { len: usize, limit: usize },
    #[error("rule compilation failed: {0}")]
    Rules(#[from] regex::Error),
}

/// Score from findings: 100 minus per-severity penalties, floored at 0.
pub fn safety_score(findings: &[Finding]) -> u8 {
    let penalty: u32 = findings.iter().map(|f| u32::from(f.severity().penalty())).sum();
    100u32.saturating_sub(penalty) as u8
}

/// Escalation policy. Critical findings, and high findings that a pattern proves on its own, block.
/// A score under `threshold` or any other high finding holds for review.
pub fn decide(findings: &[Finding], score: u8, threshold: u8) -> Verdict {
    let conclusive = findings
        .iter()
        .any(|f| f.severity() == Severity::Critical || (f.severity() == Severity::High && f.is_deterministic()));
    if conclusive {
        return Verdict::Block;
    }
    let has_high = findings.iter().any(|f| f.severity() >= Severity::High);
    if score < threshold || has_high {
        Verdict::Hold
    } else if !findings.is_empty() {
        Verdict::Warn
    } else {
        Verdict::Allow
    }
}
