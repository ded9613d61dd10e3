//! vigil-core: moderated generation for a chat assistant.
//!
//! Replies are generated through a multi-key provider client with per-call rotation and backoff, scanned
//! by a deterministic Layer-1 detector, optionally reviewed by a model-assisted Layer-2 pass, and held
//! for human triage when escalated. Review outcomes are applied back onto the stored message and the
//! owner is notified.

mod config;
mod detection;
mod generation;
mod lifecycle;
mod notify;
mod pipeline;
mod provider;
mod runtime;
mod shared;
mod store;

pub use config::{
    DetectionSettings, GatewaySettings, ProviderSettings, RetrySettings, VigilConfig, DEFAULT_SAFETY_THRESHOLD,
    DEFAULT_TITLE_FALLBACK,
};

pub use shared::{
    AnomalyLog, AnomalyStatus, AnomalyType, Attachment, DetectionLayer, Emotion, Finding, FindingSummary, Identity,
    InjectionTechnique, Intensity, Message, PiiKind, PolicyRule, ReviewAction, ReviewRecord, Role, SemanticAnalysis,
    SemanticIssue, SemanticIssueKind, Severity, UnsafeCategory, UserRole,
};

pub use provider::{
    classify, ApiKey, ChatMessage, ChatRequest, ClientFactory, KeyCursor, KeyPool, KeyPoolError, OpenRouterClient,
    OpenRouterFactory, ProviderClient, ProviderError, ProviderErrorKind, ProviderStream, SseDecoder, SseItem,
};

pub use generation::{GenerationClient, GenerationError, GenerationStream, RetryPolicy};

pub use detection::{
    decide, parse_review, read_emotion, safety_score, DetectionContext, DetectionError, DetectionReport,
    DeterministicDetector, EmotionReading, SemanticDetector, SemanticError, SemanticReview, Verdict,
};

pub use store::{AnomalyFilter, FeedbackRecord, ModerationStore, SledModerationStore, StoreError};

pub use notify::{NotificationDispatcher, NotificationEvent, Notifier};

pub use lifecycle::{AnomalyLifecycle, ModerationStats, Resolution, ReviewError, ReviewRequest};

pub use pipeline::{ModerationOutcome, ModerationPipeline, TurnEvent, TurnStream};

pub use runtime::{BootstrapError, VigilRuntime};
