//! Shared types used across the moderation core: messages, anomaly records, findings and review outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Identity (supplied by the auth collaborator)
// -----------------------------------------------------------------------------

/// Role of the caller as asserted by the auth/session layer. The core trusts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

impl UserRole {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => UserRole::Admin,
            _ => UserRole::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: UserRole,
}

impl Identity {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: UserRole::User }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: UserRole::Admin }
    }

    #[inline]
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

// -----------------------------------------------------------------------------
// Messages
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Attachment descriptor. Opaque to the core: echoed, never validated or fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub name: String,
}

/// One chat message. `content` is only ever rewritten by the review lifecycle when a correction is applied;
/// every other writer appends new messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: String,
    /// Owner of the chat this message belongs to.
    pub user_id: String,
    pub role: Role,
    pub content: String,
    /// Snapshot of `content` taken when the first admin correction was applied.
    #[serde(default)]
    pub original_content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub safety_score: Option<u8>,
    /// Set only when Layer-2 ran.
    #[serde(default)]
    pub accuracy_score: Option<u8>,
    /// Present iff Layer-2 ran.
    #[serde(default)]
    pub semantic_analysis: Option<SemanticAnalysis>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub is_warning: bool,
    #[serde(default)]
    pub is_pending_review: bool,
    #[serde(default)]
    pub is_admin_corrected: bool,
    #[serde(default)]
    pub corrected_by: Option<String>,
    #[serde(default)]
    pub corrected_at: Option<DateTime<Utc>>,
    /// Anomaly whose correction produced the current `content`. Used to make correction replay a no-op.
    #[serde(default)]
    pub correction_anomaly_id: Option<Uuid>,
    #[serde(default)]
    pub has_notification: bool,
    #[serde(default)]
    pub notification_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(chat_id: impl Into<String>, user_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            role,
            content: content.into(),
            original_content: None,
            attachments: Vec::new(),
            safety_score: None,
            accuracy_score: None,
            semantic_analysis: None,
            is_blocked: false,
            is_warning: false,
            is_pending_review: false,
            is_admin_corrected: false,
            corrected_by: None,
            corrected_at: None,
            correction_anomaly_id: None,
            has_notification: false,
            notification_read: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Whether the end user may see this message's content right now.
    #[inline]
    pub fn is_visible(&self) -> bool {
        !self.is_blocked && !self.is_pending_review
    }
}

// -----------------------------------------------------------------------------
// Finding taxonomy
// -----------------------------------------------------------------------------

/// Severity of a finding or anomaly. Ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Points subtracted from the safety score for one finding of this severity.
    pub fn penalty(&self) -> u8 {
        match self {
            Severity::Low => 10,
            Severity::Medium => 25,
            Severity::High => 45,
            Severity::Critical => 70,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    PiiLeak,
    PromptInjection,
    UnsafeContent,
    PolicyViolation,
    EmotionalDistress,
    FactualInaccuracy,
    /// Layer-1 could not scan the text; the message was failed closed.
    ScanFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Ssn,
    CreditCard,
    SecretKey,
    Email,
    Phone,
}

impl PiiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::Ssn => "ssn",
            PiiKind::CreditCard => "credit_card",
            PiiKind::SecretKey => "secret_key",
            PiiKind::Email => "email",
            PiiKind::Phone => "phone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionTechnique {
    InstructionOverride,
    PromptExtraction,
    RoleHijack,
}

impl InjectionTechnique {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionTechnique::InstructionOverride => "instruction_override",
            InjectionTechnique::PromptExtraction => "prompt_extraction",
            InjectionTechnique::RoleHijack => "role_hijack",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsafeCategory {
    Weapons,
    Drugs,
    SelfHarm,
    Violence,
}

impl UnsafeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnsafeCategory::Weapons => "weapons",
            UnsafeCategory::Drugs => "drugs",
            UnsafeCategory::SelfHarm => "self_harm",
            UnsafeCategory::Violence => "violence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    SystemPromptDisclosure,
    StopTreatment,
    GuaranteedReturns,
}

impl PolicyRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyRule::SystemPromptDisclosure => "system_prompt_disclosure",
            PolicyRule::StopTreatment => "stop_treatment",
            PolicyRule::GuaranteedReturns => "guaranteed_returns",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    Joy,
    Sadness,
    Anger,
    Fear,
    Anxiety,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Joy => "joy",
            Emotion::Sadness => "sadness",
            Emotion::Anger => "anger",
            Emotion::Fear => "fear",
            Emotion::Anxiety => "anxiety",
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, Emotion::Sadness | Emotion::Anger | Emotion::Fear | Emotion::Anxiety)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    #[default]
    Low,
    Medium,
    High,
}

impl Intensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticIssueKind {
    FactualError,
    UnsupportedClaim,
    HarmfulAdvice,
    OffTopic,
    #[serde(other)]
    Other,
}

impl SemanticIssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticIssueKind::FactualError => "factual_error",
            SemanticIssueKind::UnsupportedClaim => "unsupported_claim",
            SemanticIssueKind::HarmfulAdvice => "harmful_advice",
            SemanticIssueKind::OffTopic => "off_topic",
            SemanticIssueKind::Other => "other",
        }
    }
}

/// One structured detection finding. Closed set: each kind carries its own typed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Finding {
    /// `excerpt` is already redacted.
    PiiLeak { pii: PiiKind, excerpt: String },
    PromptInjection { technique: InjectionTechnique, matched: String },
    UnsafeContent { category: UnsafeCategory, matched: String },
    PolicyViolation { rule: PolicyRule, matched: String },
    EmotionalDistress { emotion: Emotion, intensity: Intensity },
    /// Raised by the semantic reviewer.
    Semantic { kind: SemanticIssueKind, detail: String },
    ScanFailure { reason: String },
}

impl Finding {
    pub fn anomaly_type(&self) -> AnomalyType {
        match self {
            Finding::PiiLeak { .. } => AnomalyType::PiiLeak,
            Finding::PromptInjection { .. } => AnomalyType::PromptInjection,
            Finding::UnsafeContent { .. } => AnomalyType::UnsafeContent,
            Finding::PolicyViolation { .. } => AnomalyType::PolicyViolation,
            Finding::EmotionalDistress { .. } => AnomalyType::EmotionalDistress,
            Finding::Semantic { kind, .. } => match kind {
                SemanticIssueKind::FactualError | SemanticIssueKind::UnsupportedClaim => AnomalyType::FactualInaccuracy,
                SemanticIssueKind::HarmfulAdvice => AnomalyType::UnsafeContent,
                SemanticIssueKind::OffTopic | SemanticIssueKind::Other => AnomalyType::PolicyViolation,
            },
            Finding::ScanFailure { .. } => AnomalyType::ScanFailure,
        }
    }

    pub fn sub_type(&self) -> &'static str {
        match self {
            Finding::PiiLeak { pii, .. } => pii.as_str(),
            Finding::PromptInjection { technique, .. } => technique.as_str(),
            Finding::UnsafeContent { category, .. } => category.as_str(),
            Finding::PolicyViolation { rule, .. } => rule.as_str(),
            Finding::EmotionalDistress { emotion, .. } => emotion.as_str(),
            Finding::Semantic { kind, .. } => kind.as_str(),
            Finding::ScanFailure { .. } => "scan_failure",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Finding::PiiLeak { pii, .. } => match pii {
                PiiKind::SecretKey => Severity::Critical,
                PiiKind::Ssn | PiiKind::CreditCard => Severity::High,
                PiiKind::Email | PiiKind::Phone => Severity::Low,
            },
            Finding::PromptInjection { .. } => Severity::High,
            Finding::UnsafeContent { category, .. } => match category {
                UnsafeCategory::Weapons => Severity::Critical,
                UnsafeCategory::Drugs | UnsafeCategory::SelfHarm => Severity::High,
                UnsafeCategory::Violence => Severity::Medium,
            },
            Finding::PolicyViolation { rule, .. } => match rule {
                PolicyRule::SystemPromptDisclosure | PolicyRule::StopTreatment => Severity::High,
                PolicyRule::GuaranteedReturns => Severity::Medium,
            },
            Finding::EmotionalDistress { .. } => Severity::Medium,
            Finding::Semantic { kind, .. } => match kind {
                SemanticIssueKind::HarmfulAdvice => Severity::High,
                SemanticIssueKind::FactualError => Severity::Medium,
                SemanticIssueKind::UnsupportedClaim | SemanticIssueKind::OffTopic | SemanticIssueKind::Other => Severity::Low,
            },
            Finding::ScanFailure { .. } => Severity::Critical,
        }
    }

    /// True when a pattern match alone is conclusive (structured PII, explicit weapon construction).
    /// Everything else is phrasing-dependent and needs a second look before a block.
    pub fn is_deterministic(&self) -> bool {
        match self {
            Finding::PiiLeak { pii, .. } => matches!(pii, PiiKind::Ssn | PiiKind::CreditCard | PiiKind::SecretKey),
            Finding::UnsafeContent { category, .. } => *category == UnsafeCategory::Weapons,
            Finding::ScanFailure { .. } => true,
            _ => false,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Finding::PiiLeak { pii, excerpt } => format!("Possible {} disclosed: {}", pii.as_str().replace('_', " "), excerpt),
            Finding::PromptInjection { technique, .. } => {
                format!("Prompt injection attempt ({})", technique.as_str().replace('_', " "))
            }
            Finding::UnsafeContent { category, matched } => {
                format!("Unsafe content ({}): \"{}\"", category.as_str().replace('_', " "), matched)
            }
            Finding::PolicyViolation { rule, .. } => format!("Policy violation: {}", rule.as_str().replace('_', " ")),
            Finding::EmotionalDistress { emotion, intensity } => {
                format!("User shows {} at {} intensity", emotion.as_str(), intensity.as_str())
            }
            Finding::Semantic { detail, .. } => detail.clone(),
            Finding::ScanFailure { reason } => format!("Deterministic scan failed: {}", reason),
        }
    }

    /// Flat `{type, subType, message}` view for dashboards.
    pub fn summary(&self) -> FindingSummary {
        FindingSummary {
            anomaly_type: self.anomaly_type(),
            sub_type: self.sub_type().to_string(),
            message: self.message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingSummary {
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub sub_type: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticIssue {
    pub kind: SemanticIssueKind,
    pub detail: String,
}

/// Structured Layer-2 output stored on the message and the anomaly record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticAnalysis {
    pub risk_level: Severity,
    #[serde(default)]
    pub issues: Vec<SemanticIssue>,
    #[serde(default)]
    pub summary: String,
}

// -----------------------------------------------------------------------------
// Anomaly records and review outcomes
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionLayer {
    Deterministic,
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Pending,
    Approved,
    Blocked,
    Corrected,
}

impl AnomalyStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnomalyStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyStatus::Pending => "pending",
            AnomalyStatus::Approved => "approved",
            AnomalyStatus::Blocked => "blocked",
            AnomalyStatus::Corrected => "corrected",
        }
    }
}

impl std::fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Block,
    Correct,
}

impl ReviewAction {
    pub fn target_status(&self) -> AnomalyStatus {
        match self {
            ReviewAction::Approve => AnomalyStatus::Approved,
            ReviewAction::Block => AnomalyStatus::Blocked,
            ReviewAction::Correct => AnomalyStatus::Corrected,
        }
    }

    /// Label shown to the message owner in the notification.
    pub fn response_label(&self) -> &'static str {
        match self {
            ReviewAction::Approve => "Response approved",
            ReviewAction::Block => "Response blocked",
            ReviewAction::Correct => "Response corrected by admin",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Approve => "approve",
            ReviewAction::Block => "block",
            ReviewAction::Correct => "correct",
        }
    }

    pub fn from_status(status: AnomalyStatus) -> Option<Self> {
        match status {
            AnomalyStatus::Pending => None,
            AnomalyStatus::Approved => Some(ReviewAction::Approve),
            AnomalyStatus::Blocked => Some(ReviewAction::Block),
            AnomalyStatus::Corrected => Some(ReviewAction::Correct),
        }
    }
}

/// Who resolved an anomaly and when. Written as one value so reviewer and timestamp cannot diverge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewer: String,
    pub reviewed_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// One detection event on one message. Append-mostly: only `status`, `review`, `admin_response`
/// and `feedback_applied` change after creation, and each at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyLog {
    pub id: Uuid,
    pub user_id: String,
    pub chat_id: String,
    pub message_id: Uuid,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub layer: DetectionLayer,
    pub detection_details: Vec<Finding>,
    pub safety_score: u8,
    #[serde(default)]
    pub accuracy_score: Option<u8>,
    pub user_emotion: Emotion,
    pub emotion_intensity: Intensity,
    pub status: AnomalyStatus,
    #[serde(default)]
    pub review: Option<ReviewRecord>,
    /// Only set for `corrected`.
    #[serde(default)]
    pub admin_response: Option<String>,
    #[serde(default)]
    pub feedback_applied: bool,
    pub created_at: DateTime<Utc>,
}

impl AnomalyLog {
    pub fn detail_summaries(&self) -> Vec<FindingSummary> {
        self.detection_details.iter().map(Finding::summary).collect()
    }
}
