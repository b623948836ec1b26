//! crates/studius_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::{
    Account, AccountCredentials, ArtifactPatch, AuthContext, CreditTransaction, LedgerEntryKind,
    OperationKind, OralExamSession, PaymentEvent, ProcessingMetadata,
    ProcessingPatch, SectionResult, StudySession, StudySessionSummary, UltraJob, UltraJobState,
    UltraKind,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Conflict: {0}")]
    Conflict(String),
    /// A transient failure (timeout, rate limit, dropped connection). Safe to retry.
    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PortError::Unavailable(_))
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// Result of the atomic "debit if balance >= cost" operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Debited { new_balance: i64 },
    Insufficient { required: i64, available: i64 },
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Accounts ---

    /// Creates an account holding `starting_balance`, recorded as a `Welcome` ledger entry.
    /// Fails with `Conflict` when the email is taken.
    async fn create_account(
        &self,
        email: &str,
        hashed_password: &str,
        starting_balance: i64,
    ) -> PortResult<Account>;

    async fn get_account(&self, account_id: Uuid) -> PortResult<Account>;

    async fn get_credentials_by_email(&self, email: &str) -> PortResult<AccountCredentials>;

    // --- Auth Sessions ---

    async fn create_auth_session(
        &self,
        token: &str,
        account_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    /// Resolves a live token to its caller. Unknown or expired tokens are `Unauthorized`.
    async fn resolve_auth_session(&self, token: &str) -> PortResult<AuthContext>;

    async fn delete_auth_session(&self, token: &str) -> PortResult<()>;

    // --- Credit Ledger ---

    /// Atomically debits `cost` if and only if the balance covers it, appending
    /// the matching ledger entry in the same unit of work.
    async fn try_debit(
        &self,
        account_id: Uuid,
        kind: OperationKind,
        cost: i64,
    ) -> PortResult<DebitOutcome>;

    /// Adds `amount` to the balance and appends a ledger entry. Returns the new balance.
    async fn credit(&self, account_id: Uuid, amount: i64, kind: LedgerEntryKind)
        -> PortResult<i64>;

    /// Credits a confirmed payment once per `event_id`.
    /// Returns `None` when the event was already processed.
    async fn credit_payment(&self, event: &PaymentEvent, amount: i64) -> PortResult<Option<i64>>;

    /// Ledger entries, newest first.
    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> PortResult<Vec<CreditTransaction>>;

    /// Marks the account's free oral exam as used. Returns `true` only for the
    /// single call that flips the flag.
    async fn claim_free_oral_exam(&self, account_id: Uuid) -> PortResult<bool>;

    /// Gives the free oral exam back after a start that could not be persisted.
    async fn release_free_oral_exam(&self, account_id: Uuid) -> PortResult<()>;

    // --- Study Sessions ---

    async fn create_study_session(
        &self,
        account_id: Uuid,
        title: &str,
        language: &str,
        document_text: &str,
    ) -> PortResult<StudySession>;

    async fn get_study_session(&self, session_id: Uuid) -> PortResult<StudySession>;

    async fn list_study_sessions(&self, account_id: Uuid) -> PortResult<Vec<StudySessionSummary>>;

    /// Replaces exactly one artifact of the session.
    async fn save_artifact(&self, session_id: Uuid, patch: ArtifactPatch) -> PortResult<()>;

    // --- Processing Metadata ---

    /// Returns the stored metadata, or a `not_started` default.
    async fn get_processing(
        &self,
        session_id: Uuid,
        kind: UltraKind,
    ) -> PortResult<ProcessingMetadata>;

    async fn list_processing(&self, session_id: Uuid) -> PortResult<Vec<ProcessingMetadata>>;

    /// Read-merge-write of one metadata row via `ProcessingMetadata::apply`.
    /// A patch that would regress progress fails with `Conflict`.
    async fn update_processing(
        &self,
        session_id: Uuid,
        kind: UltraKind,
        patch: ProcessingPatch,
    ) -> PortResult<ProcessingMetadata>;

    // --- Ultra Jobs ---

    /// Queues a job. Fails with `Conflict` if one is already queued or running for
    /// the same session and kind, or if that kind already completed.
    async fn enqueue_ultra_job(
        &self,
        session_id: Uuid,
        account_id: Uuid,
        kind: UltraKind,
        debited: i64,
    ) -> PortResult<UltraJob>;

    /// Claims the oldest queued job, or a running one whose lease expired,
    /// incrementing its attempt counter.
    async fn claim_next_ultra_job(&self, lease: Duration) -> PortResult<Option<UltraJob>>;

    /// Extends the lease of a running job, but only for the claim that made
    /// `attempt`. Returns `false` once the job was reclaimed or finished.
    async fn renew_ultra_job_lease(
        &self,
        job_id: Uuid,
        attempt: u32,
        lease: Duration,
    ) -> PortResult<bool>;

    /// Moves a queued/running job to a terminal state. Returns `false` if it was
    /// already terminal, so callers can act exactly once on the transition.
    async fn finish_ultra_job(&self, job_id: Uuid, state: UltraJobState) -> PortResult<bool>;

    async fn save_section_result(&self, result: SectionResult) -> PortResult<()>;

    async fn get_section_results(&self, job_id: Uuid) -> PortResult<Vec<SectionResult>>;

    // --- Oral Exams ---

    async fn create_oral_exam(&self, exam: &OralExamSession) -> PortResult<()>;

    async fn get_oral_exam(&self, exam_id: Uuid) -> PortResult<OralExamSession>;

    /// Compare-and-set save: succeeds only if the stored revision is still
    /// `expected_revision`, otherwise fails with `Conflict`. `exam.revision`
    /// is stored as the new revision.
    async fn save_oral_exam(
        &self,
        exam: &OralExamSession,
        expected_revision: i64,
    ) -> PortResult<()>;
}

#[async_trait]
pub trait LanguageModelService: Send + Sync {
    /// Runs one completion. `instructions` carries the task and output schema,
    /// `input` the document material.
    async fn complete(&self, instructions: &str, input: &str) -> PortResult<String>;
}

#[async_trait]
pub trait SpeechToTextService: Send + Sync {
    /// Transcribes a slice of audio data into text.
    async fn transcribe_audio(&self, audio_data: &[u8]) -> PortResult<String>;
}
