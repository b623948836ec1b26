//! crates/studius_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database; the ones that travel through
//! the language model or a JSON column derive `serde`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Balance granted to an account the first time it is created.
pub const DEFAULT_STARTING_CREDITS: i64 = 120;

//=========================================================================================
// Accounts & Authentication
//=========================================================================================

/// A paying (or trial) user of the study assistant.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub balance: i64,
    pub free_oral_exam_used: bool,
    pub created_at: DateTime<Utc>,
}

// Only used internally for login/signup - contains sensitive data
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub account_id: Uuid,
    pub email: String,
    pub hashed_password: String,
}

/// The resolved identity of the caller of one request.
///
/// Produced by the auth middleware from a bearer token and handed to each
/// operation explicitly. It is never mutated; logging in yields a new
/// `AuthSession`, logging out deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub account_id: Uuid,
    pub email: String,
}

// Represents a login session (bearer token / cookie)
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub account_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

//=========================================================================================
// Credits
//=========================================================================================

/// Every paid operation the service offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Summary,
    ExtendedSummary,
    Flashcards,
    Quiz,
    ConceptMap,
    ExamGuide,
    Tutor,
    OralExam,
    OralExamUltra,
    UltraSummary,
    UltraConceptMap,
}

impl OperationKind {
    pub const ALL: [OperationKind; 11] = [
        OperationKind::Summary,
        OperationKind::ExtendedSummary,
        OperationKind::Flashcards,
        OperationKind::Quiz,
        OperationKind::ConceptMap,
        OperationKind::ExamGuide,
        OperationKind::Tutor,
        OperationKind::OralExam,
        OperationKind::OralExamUltra,
        OperationKind::UltraSummary,
        OperationKind::UltraConceptMap,
    ];

    /// Fixed price list, in credits.
    pub const fn cost(self) -> i64 {
        match self {
            OperationKind::Summary => 10,
            OperationKind::ExtendedSummary => 15,
            OperationKind::Flashcards => 8,
            OperationKind::Quiz => 8,
            OperationKind::ConceptMap => 6,
            OperationKind::ExamGuide => 12,
            OperationKind::Tutor => 5,
            OperationKind::OralExam => 25,
            OperationKind::OralExamUltra => 50,
            OperationKind::UltraSummary => 40,
            OperationKind::UltraConceptMap => 30,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::Summary => "summary",
            OperationKind::ExtendedSummary => "extended_summary",
            OperationKind::Flashcards => "flashcards",
            OperationKind::Quiz => "quiz",
            OperationKind::ConceptMap => "concept_map",
            OperationKind::ExamGuide => "exam_guide",
            OperationKind::Tutor => "tutor",
            OperationKind::OralExam => "oral_exam",
            OperationKind::OralExamUltra => "oral_exam_ultra",
            OperationKind::UltraSummary => "ultra_summary",
            OperationKind::UltraConceptMap => "ultra_concept_map",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credit packs sold through the payment processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Starter,
    Pro,
    Ultra,
}

impl Plan {
    pub const fn credits(self) -> i64 {
        match self {
            Plan::Starter => 150,
            Plan::Pro => 500,
            Plan::Ultra => 1500,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Ultra => "ultra",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [Plan::Starter, Plan::Pro, Plan::Ultra]
            .into_iter()
            .find(|plan| plan.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    Stripe,
    Paypal,
}

impl PaymentProvider {
    pub const fn as_str(self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::Paypal => "paypal",
        }
    }
}

/// A confirmed payment reported by a processor callback.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    /// Processor-assigned id; each one may credit an account at most once.
    pub event_id: String,
    pub provider: PaymentProvider,
    pub account_id: Uuid,
    pub plan: Plan,
}

/// What a ledger row was written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntryKind {
    Welcome,
    Operation(OperationKind),
    Purchase(Plan),
    Refund(OperationKind),
}

impl LedgerEntryKind {
    /// Stable textual form used in storage, e.g. `quiz`, `purchase:pro`, `refund:ultra_summary`.
    pub fn encode(&self) -> String {
        match self {
            LedgerEntryKind::Welcome => "welcome".to_string(),
            LedgerEntryKind::Operation(kind) => kind.as_str().to_string(),
            LedgerEntryKind::Purchase(plan) => format!("purchase:{}", plan.as_str()),
            LedgerEntryKind::Refund(kind) => format!("refund:{}", kind.as_str()),
        }
    }

    pub fn decode(value: &str) -> Option<Self> {
        if value == "welcome" {
            return Some(LedgerEntryKind::Welcome);
        }
        if let Some(plan) = value.strip_prefix("purchase:") {
            return Plan::parse(plan).map(LedgerEntryKind::Purchase);
        }
        if let Some(kind) = value.strip_prefix("refund:") {
            return OperationKind::parse(kind).map(LedgerEntryKind::Refund);
        }
        OperationKind::parse(value).map(LedgerEntryKind::Operation)
    }
}

/// Append-only ledger entry. Negative `delta` for consumption.
#[derive(Debug, Clone)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: LedgerEntryKind,
    pub delta: i64,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Artifacts
//=========================================================================================

/// The single-request artifacts a study session can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Summary,
    ExtendedSummary,
    Flashcards,
    Quiz,
    ConceptMap,
    ExamGuide,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        ArtifactKind::Summary,
        ArtifactKind::ExtendedSummary,
        ArtifactKind::Flashcards,
        ArtifactKind::Quiz,
        ArtifactKind::ConceptMap,
        ArtifactKind::ExamGuide,
    ];

    /// URL path segment.
    pub const fn slug(self) -> &'static str {
        match self {
            ArtifactKind::Summary => "summary",
            ArtifactKind::ExtendedSummary => "extended-summary",
            ArtifactKind::Flashcards => "flashcards",
            ArtifactKind::Quiz => "quiz",
            ArtifactKind::ConceptMap => "concept-map",
            ArtifactKind::ExamGuide => "exam-guide",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.slug() == slug)
    }

    pub const fn operation(self) -> OperationKind {
        match self {
            ArtifactKind::Summary => OperationKind::Summary,
            ArtifactKind::ExtendedSummary => OperationKind::ExtendedSummary,
            ArtifactKind::Flashcards => OperationKind::Flashcards,
            ArtifactKind::Quiz => OperationKind::Quiz,
            ArtifactKind::ConceptMap => OperationKind::ConceptMap,
            ArtifactKind::ExamGuide => OperationKind::ExamGuide,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryArtifact {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashcardSet {
    pub flashcards: Vec<Flashcard>,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_index: usize,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    pub questions: Vec<QuizQuestion>,
    #[serde(default)]
    pub placeholder: bool,
}

/// Type tag of a concept-map node. Unknown tags read as `Concept`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    #[default]
    Concept,
    Definition,
    Formula,
    Example,
    Process,
    Law,
    Theory,
}

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Concept,
        NodeKind::Definition,
        NodeKind::Formula,
        NodeKind::Example,
        NodeKind::Process,
        NodeKind::Law,
        NodeKind::Theory,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            NodeKind::Concept => "concept",
            NodeKind::Definition => "definition",
            NodeKind::Formula => "formula",
            NodeKind::Example => "example",
            NodeKind::Process => "process",
            NodeKind::Law => "law",
            NodeKind::Theory => "theory",
        }
    }
}

impl From<String> for NodeKind {
    fn from(value: String) -> Self {
        let value = value.trim().to_ascii_lowercase();
        NodeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .unwrap_or_default()
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Study priority of a concept-map node. Unknown tags read as `Medium`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl From<String> for Priority {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" | "alta" => Priority::High,
            "low" | "bassa" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

impl From<Priority> for String {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConceptNode>,
    /// Titles of nodes elsewhere in the map sharing a keyword with this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

impl ConceptNode {
    pub fn new(title: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            title: title.into(),
            description: None,
            kind,
            priority: Priority::Medium,
            children: Vec::new(),
            related: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptMap {
    pub root: ConceptNode,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamPhase {
    pub title: String,
    pub duration_minutes: u32,
    pub description: String,
}

/// "Exam in one hour": a fixed sequence of timed study phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamGuide {
    pub phases: Vec<ExamPhase>,
    #[serde(default)]
    pub placeholder: bool,
}

/// All artifacts of a study session; each is `None` until generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    pub summary: Option<SummaryArtifact>,
    pub extended_summary: Option<SummaryArtifact>,
    pub flashcards: Option<FlashcardSet>,
    pub quiz: Option<Quiz>,
    pub concept_map: Option<ConceptMap>,
    pub exam_guide: Option<ExamGuide>,
    /// Merged section-by-section results of the Ultra pipeline.
    pub ultra_summary: Option<SummaryArtifact>,
    pub ultra_concept_map: Option<ConceptMap>,
}

/// A field-level update of one artifact. Sibling artifacts are never touched.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactPatch {
    Summary(SummaryArtifact),
    ExtendedSummary(SummaryArtifact),
    Flashcards(FlashcardSet),
    Quiz(Quiz),
    ConceptMap(ConceptMap),
    ExamGuide(ExamGuide),
    UltraSummary(SummaryArtifact),
    UltraConceptMap(ConceptMap),
}

impl ArtifactPatch {
    /// Name of the `Artifacts` field (and storage column) this patch replaces.
    pub const fn field(&self) -> &'static str {
        match self {
            ArtifactPatch::Summary(_) => "summary",
            ArtifactPatch::ExtendedSummary(_) => "extended_summary",
            ArtifactPatch::Flashcards(_) => "flashcards",
            ArtifactPatch::Quiz(_) => "quiz",
            ArtifactPatch::ConceptMap(_) => "concept_map",
            ArtifactPatch::ExamGuide(_) => "exam_guide",
            ArtifactPatch::UltraSummary(_) => "ultra_summary",
            ArtifactPatch::UltraConceptMap(_) => "ultra_concept_map",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            ArtifactPatch::Summary(a)
            | ArtifactPatch::ExtendedSummary(a)
            | ArtifactPatch::UltraSummary(a) => serde_json::to_value(a),
            ArtifactPatch::Flashcards(a) => serde_json::to_value(a),
            ArtifactPatch::Quiz(a) => serde_json::to_value(a),
            ArtifactPatch::ConceptMap(a) | ArtifactPatch::UltraConceptMap(a) => {
                serde_json::to_value(a)
            }
            ArtifactPatch::ExamGuide(a) => serde_json::to_value(a),
        };
        // Plain structs of strings and numbers always serialize.
        value.unwrap_or(serde_json::Value::Null)
    }
}

impl Artifacts {
    pub fn apply(&mut self, patch: ArtifactPatch) {
        match patch {
            ArtifactPatch::Summary(a) => self.summary = Some(a),
            ArtifactPatch::ExtendedSummary(a) => self.extended_summary = Some(a),
            ArtifactPatch::Flashcards(a) => self.flashcards = Some(a),
            ArtifactPatch::Quiz(a) => self.quiz = Some(a),
            ArtifactPatch::ConceptMap(a) => self.concept_map = Some(a),
            ArtifactPatch::ExamGuide(a) => self.exam_guide = Some(a),
            ArtifactPatch::UltraSummary(a) => self.ultra_summary = Some(a),
            ArtifactPatch::UltraConceptMap(a) => self.ultra_concept_map = Some(a),
        }
    }
}

//=========================================================================================
// Study Sessions
//=========================================================================================

/// One uploaded document and everything generated from it.
#[derive(Debug, Clone)]
pub struct StudySession {
    pub id: Uuid,
    pub account_id: Uuid,
    pub title: String,
    /// Target language code for generated content, e.g. `it` or `en`.
    pub language: String,
    pub document_text: String,
    pub artifacts: Artifacts,
    pub created_at: DateTime<Utc>,
}

impl StudySession {
    pub fn document_chars(&self) -> usize {
        self.document_text.chars().count()
    }
}

/// Lightweight listing row, without document text or artifacts.
#[derive(Debug, Clone)]
pub struct StudySessionSummary {
    pub id: Uuid,
    pub title: String,
    pub language: String,
    pub document_chars: usize,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Ultra Pipeline
//=========================================================================================

/// Artifacts that can be produced section by section for large documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UltraKind {
    Summary,
    ConceptMap,
}

impl UltraKind {
    pub const ALL: [UltraKind; 2] = [UltraKind::Summary, UltraKind::ConceptMap];

    pub const fn as_str(self) -> &'static str {
        match self {
            UltraKind::Summary => "summary",
            UltraKind::ConceptMap => "concept_map",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    pub const fn slug(self) -> &'static str {
        match self {
            UltraKind::Summary => "summary",
            UltraKind::ConceptMap => "concept-map",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.slug() == slug)
    }

    pub const fn operation(self) -> OperationKind {
        match self {
            UltraKind::Summary => OperationKind::UltraSummary,
            UltraKind::ConceptMap => OperationKind::UltraConceptMap,
        }
    }
}

/// Client-visible status of a long-running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not_started",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            JobStatus::NotStarted,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
        .into_iter()
        .find(|status| status.as_str() == value)
    }
}

/// Progress of one Ultra kind on one study session, as polled by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub kind: UltraKind,
    pub status: JobStatus,
    pub current_section: u32,
    pub total_sections: u32,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A partial update of `ProcessingMetadata`; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingPatch {
    pub status: Option<JobStatus>,
    pub current_section: Option<u32>,
    pub total_sections: Option<u32>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProcessingPatch {
    pub fn started(total_sections: u32, estimated_completion: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::InProgress),
            total_sections: Some(total_sections),
            estimated_completion: Some(estimated_completion),
            ..Default::default()
        }
    }

    pub fn working_on(section: u32, estimated_completion: DateTime<Utc>) -> Self {
        Self {
            current_section: Some(section),
            estimated_completion: Some(estimated_completion),
            ..Default::default()
        }
    }

    pub fn completed(total_sections: u32) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            current_section: Some(total_sections),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            last_error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    #[error("a completed job cannot be moved back to {0:?}")]
    Reopened(JobStatus),
    #[error("progress cannot go backwards ({from} -> {to})")]
    Regressed { from: u32, to: u32 },
    #[error("section {current} is beyond the total of {total}")]
    OutOfRange { current: u32, total: u32 },
}

impl ProcessingMetadata {
    pub fn new(kind: UltraKind) -> Self {
        Self {
            kind,
            status: JobStatus::NotStarted,
            current_section: 0,
            total_sections: 0,
            estimated_completion: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Merges `patch` into `self`, refusing any change that would make an
    /// observer see progress move backwards.
    ///
    /// Entering `InProgress` from `NotStarted` or `Failed` begins a new run and
    /// resets the section counter; `InProgress -> InProgress` continues the run.
    pub fn apply(&mut self, patch: ProcessingPatch) -> Result<(), ProgressError> {
        let mut next = self.clone();

        if let Some(status) = patch.status {
            if self.status == JobStatus::Completed && status != JobStatus::Completed {
                return Err(ProgressError::Reopened(status));
            }
            let new_run = status == JobStatus::InProgress
                && matches!(self.status, JobStatus::NotStarted | JobStatus::Failed);
            if new_run {
                next.current_section = 0;
                next.last_error = None;
            }
            next.status = status;
        }
        if let Some(total) = patch.total_sections {
            next.total_sections = total;
        }
        if let Some(current) = patch.current_section {
            if current < next.current_section {
                return Err(ProgressError::Regressed {
                    from: next.current_section,
                    to: current,
                });
            }
            next.current_section = current;
        }
        if next.current_section > next.total_sections {
            return Err(ProgressError::OutOfRange {
                current: next.current_section,
                total: next.total_sections,
            });
        }
        if patch.estimated_completion.is_some() {
            next.estimated_completion = patch.estimated_completion;
        }
        if patch.last_error.is_some() {
            next.last_error = patch.last_error;
        }
        if next.status == JobStatus::Failed && next.last_error.is_none() {
            next.last_error = Some("job failed".to_string());
        }
        if next.status == JobStatus::Completed {
            next.estimated_completion = None;
        }
        next.updated_at = Utc::now();

        *self = next;
        Ok(())
    }
}

/// Lifecycle of the durable job record (distinct from the client-facing status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UltraJobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl UltraJobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            UltraJobState::Queued => "queued",
            UltraJobState::Running => "running",
            UltraJobState::Completed => "completed",
            UltraJobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            UltraJobState::Queued,
            UltraJobState::Running,
            UltraJobState::Completed,
            UltraJobState::Failed,
        ]
        .into_iter()
        .find(|state| state.as_str() == value)
    }
}

/// A durable request to run the Ultra pipeline, claimed by a worker under a lease.
#[derive(Debug, Clone)]
pub struct UltraJob {
    pub id: Uuid,
    pub study_session_id: Uuid,
    pub account_id: Uuid,
    pub kind: UltraKind,
    pub state: UltraJobState,
    /// Number of times a worker has claimed this job.
    pub attempts: u32,
    /// Credits taken when the job was submitted; refunded if it fails.
    pub debited: i64,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The persisted output of one section of one job, kept so a replaced
/// worker can resume without re-running finished sections.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionResult {
    pub job_id: Uuid,
    /// 1-based section number.
    pub index: u32,
    pub content: serde_json::Value,
    pub placeholder: bool,
}

//=========================================================================================
// Oral Exam
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OralExamMode {
    Standard,
    Ultra,
}

impl OralExamMode {
    pub const fn max_questions(self) -> usize {
        match self {
            OralExamMode::Standard => 5,
            OralExamMode::Ultra => 10,
        }
    }

    pub const fn operation(self) -> OperationKind {
        match self {
            OralExamMode::Standard => OperationKind::OralExam,
            OralExamMode::Ultra => OperationKind::OralExamUltra,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            OralExamMode::Standard => "standard",
            OralExamMode::Ultra => "ultra",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(OralExamMode::Standard),
            "ultra" => Some(OralExamMode::Ultra),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OralExamStatus {
    Idle,
    Questioning,
    Completed,
}

impl OralExamStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OralExamStatus::Idle => "idle",
            OralExamStatus::Questioning => "questioning",
            OralExamStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(OralExamStatus::Idle),
            "questioning" => Some(OralExamStatus::Questioning),
            "completed" => Some(OralExamStatus::Completed),
            _ => None,
        }
    }
}

/// One question of the oral exam, filled in as the student answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OralExamTurn {
    pub question: String,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub evaluation: Option<String>,
    /// Grade on the 0-30 scale.
    #[serde(default)]
    pub score: Option<u8>,
}

impl OralExamTurn {
    pub fn asking(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: None,
            evaluation: None,
            score: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OralExamSession {
    pub id: Uuid,
    pub account_id: Uuid,
    pub study_session_id: Uuid,
    pub mode: OralExamMode,
    pub status: OralExamStatus,
    pub turns: Vec<OralExamTurn>,
    /// Set when this exam consumed the account's one free start.
    pub free: bool,
    pub final_evaluation: Option<String>,
    pub final_score: Option<u8>,
    /// Bumped by every save; saves compare it against the stored one.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OralExamSession {
    pub fn new(account_id: Uuid, study_session_id: Uuid, mode: OralExamMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            study_session_id,
            mode,
            status: OralExamStatus::Idle,
            turns: Vec::new(),
            free: false,
            final_evaluation: None,
            final_score: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The last question, if it still awaits an answer.
    pub fn open_turn_mut(&mut self) -> Option<&mut OralExamTurn> {
        self.turns.last_mut().filter(|turn| turn.answer.is_none())
    }

    pub fn answered_count(&self) -> usize {
        self.turns.iter().filter(|turn| turn.answer.is_some()).count()
    }
}
