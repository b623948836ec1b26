//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Every operation that must be atomic (debits, credits, job claims, processing
//! merges) runs inside one transaction with the affected rows locked.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use studius_core::domain::{
    Account, AccountCredentials, ArtifactPatch, Artifacts, AuthContext, ConceptMap,
    CreditTransaction, ExamGuide, FlashcardSet, JobStatus, LedgerEntryKind, OperationKind,
    OralExamMode, OralExamSession, OralExamStatus, OralExamTurn, PaymentEvent,
    ProcessingMetadata, ProcessingPatch, Quiz, SectionResult, StudySession, StudySessionSummary,
    SummaryArtifact, UltraJob, UltraJobState, UltraKind,
};
use studius_core::ports::{DatabaseService, DebitOutcome, PortError, PortResult};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> PortResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(map_sqlx_error)
    }
}

/// Translates `sqlx` failures into the port's vocabulary.
fn map_sqlx_error(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound("row not found".to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => PortError::Conflict(db.message().to_string()),
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => PortError::Unavailable(db.message().to_string()),
            _ => PortError::Unexpected(db.to_string()),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PortError::Unavailable(e.to_string())
        }
        other => PortError::Unexpected(other.to_string()),
    }
}

fn corrupt(what: &str, value: &str) -> PortError {
    PortError::Unexpected(format!("unrecognised {} '{}' in storage", what, value))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

const ACCOUNT_COLUMNS: &str = "id, email, balance, free_oral_exam_used, created_at";

#[derive(FromRow)]
struct AccountRecord {
    id: Uuid,
    email: String,
    balance: i64,
    free_oral_exam_used: bool,
    created_at: DateTime<Utc>,
}
impl AccountRecord {
    fn to_domain(self) -> Account {
        Account {
            id: self.id,
            email: self.email,
            balance: self.balance,
            free_oral_exam_used: self.free_oral_exam_used,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct CredentialsRecord {
    id: Uuid,
    email: String,
    hashed_password: String,
}

#[derive(FromRow)]
struct TransactionRecord {
    id: Uuid,
    account_id: Uuid,
    kind: String,
    delta: i64,
    created_at: DateTime<Utc>,
}
impl TransactionRecord {
    fn to_domain(self) -> PortResult<CreditTransaction> {
        let kind =
            LedgerEntryKind::decode(&self.kind).ok_or_else(|| corrupt("ledger kind", &self.kind))?;
        Ok(CreditTransaction {
            id: self.id,
            account_id: self.account_id,
            kind,
            delta: self.delta,
            created_at: self.created_at,
        })
    }
}

const STUDY_SESSION_COLUMNS: &str = "id, account_id, title, language, document_text, summary, \
     extended_summary, flashcards, quiz, concept_map, exam_guide, ultra_summary, \
     ultra_concept_map, created_at";

#[derive(FromRow)]
struct StudySessionRecord {
    id: Uuid,
    account_id: Uuid,
    title: String,
    language: String,
    document_text: String,
    summary: Option<Json<SummaryArtifact>>,
    extended_summary: Option<Json<SummaryArtifact>>,
    flashcards: Option<Json<FlashcardSet>>,
    quiz: Option<Json<Quiz>>,
    concept_map: Option<Json<ConceptMap>>,
    exam_guide: Option<Json<ExamGuide>>,
    ultra_summary: Option<Json<SummaryArtifact>>,
    ultra_concept_map: Option<Json<ConceptMap>>,
    created_at: DateTime<Utc>,
}
impl StudySessionRecord {
    fn to_domain(self) -> StudySession {
        StudySession {
            id: self.id,
            account_id: self.account_id,
            title: self.title,
            language: self.language,
            document_text: self.document_text,
            artifacts: Artifacts {
                summary: self.summary.map(|j| j.0),
                extended_summary: self.extended_summary.map(|j| j.0),
                flashcards: self.flashcards.map(|j| j.0),
                quiz: self.quiz.map(|j| j.0),
                concept_map: self.concept_map.map(|j| j.0),
                exam_guide: self.exam_guide.map(|j| j.0),
                ultra_summary: self.ultra_summary.map(|j| j.0),
                ultra_concept_map: self.ultra_concept_map.map(|j| j.0),
            },
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct StudySessionSummaryRecord {
    id: Uuid,
    title: String,
    language: String,
    document_chars: i32,
    created_at: DateTime<Utc>,
}
impl StudySessionSummaryRecord {
    fn to_domain(self) -> StudySessionSummary {
        StudySessionSummary {
            id: self.id,
            title: self.title,
            language: self.language,
            document_chars: self.document_chars.max(0) as usize,
            created_at: self.created_at,
        }
    }
}

const PROCESSING_COLUMNS: &str = "kind, status, current_section, total_sections, \
     estimated_completion, last_error, updated_at";

#[derive(FromRow)]
struct ProcessingRecord {
    kind: String,
    status: String,
    current_section: i32,
    total_sections: i32,
    estimated_completion: Option<DateTime<Utc>>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}
impl ProcessingRecord {
    fn to_domain(self) -> PortResult<ProcessingMetadata> {
        Ok(ProcessingMetadata {
            kind: UltraKind::parse(&self.kind).ok_or_else(|| corrupt("ultra kind", &self.kind))?,
            status: JobStatus::parse(&self.status)
                .ok_or_else(|| corrupt("job status", &self.status))?,
            current_section: self.current_section.max(0) as u32,
            total_sections: self.total_sections.max(0) as u32,
            estimated_completion: self.estimated_completion,
            last_error: self.last_error,
            updated_at: self.updated_at,
        })
    }
}

const ULTRA_JOB_COLUMNS: &str = "id, study_session_id, account_id, kind, state, attempts, \
     debited, lease_expires_at, created_at";

#[derive(FromRow)]
struct UltraJobRecord {
    id: Uuid,
    study_session_id: Uuid,
    account_id: Uuid,
    kind: String,
    state: String,
    attempts: i32,
    debited: i64,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}
impl UltraJobRecord {
    fn to_domain(self) -> PortResult<UltraJob> {
        Ok(UltraJob {
            id: self.id,
            study_session_id: self.study_session_id,
            account_id: self.account_id,
            kind: UltraKind::parse(&self.kind).ok_or_else(|| corrupt("ultra kind", &self.kind))?,
            state: UltraJobState::parse(&self.state)
                .ok_or_else(|| corrupt("job state", &self.state))?,
            attempts: self.attempts.max(0) as u32,
            debited: self.debited,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct SectionResultRecord {
    job_id: Uuid,
    section_index: i32,
    content: serde_json::Value,
    placeholder: bool,
}
impl SectionResultRecord {
    fn to_domain(self) -> SectionResult {
        SectionResult {
            job_id: self.job_id,
            index: self.section_index.max(0) as u32,
            content: self.content,
            placeholder: self.placeholder,
        }
    }
}

const ORAL_EXAM_COLUMNS: &str = "id, account_id, study_session_id, mode, status, turns, free, \
     final_evaluation, final_score, revision, created_at, updated_at";

#[derive(FromRow)]
struct OralExamRecord {
    id: Uuid,
    account_id: Uuid,
    study_session_id: Uuid,
    mode: String,
    status: String,
    turns: Json<Vec<OralExamTurn>>,
    free: bool,
    final_evaluation: Option<String>,
    final_score: Option<i16>,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl OralExamRecord {
    fn to_domain(self) -> PortResult<OralExamSession> {
        Ok(OralExamSession {
            id: self.id,
            account_id: self.account_id,
            study_session_id: self.study_session_id,
            mode: OralExamMode::parse(&self.mode)
                .ok_or_else(|| corrupt("oral exam mode", &self.mode))?,
            status: OralExamStatus::parse(&self.status)
                .ok_or_else(|| corrupt("oral exam status", &self.status))?,
            turns: self.turns.0,
            free: self.free,
            final_evaluation: self.final_evaluation,
            final_score: self.final_score.map(|s| s.clamp(0, u8::MAX as i16) as u8),
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

//=========================================================================================
// Transaction Helpers
//=========================================================================================

async fn append_ledger_entry(
    tx: &mut Transaction<'static, Postgres>,
    account_id: Uuid,
    kind: LedgerEntryKind,
    delta: i64,
) -> PortResult<()> {
    sqlx::query(
        "INSERT INTO credit_transactions (id, account_id, kind, delta) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(kind.encode())
    .bind(delta)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn add_credits(
    tx: &mut Transaction<'static, Postgres>,
    account_id: Uuid,
    amount: i64,
    kind: LedgerEntryKind,
) -> PortResult<i64> {
    let balance: Option<i64> = sqlx::query_scalar(
        "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING balance",
    )
    .bind(account_id)
    .bind(amount)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;
    let balance = balance.ok_or_else(|| PortError::NotFound(format!("account {}", account_id)))?;
    append_ledger_entry(tx, account_id, kind, amount).await?;
    Ok(balance)
}

/// Ensures the metadata row exists and locks it for the rest of the transaction.
async fn lock_processing(
    tx: &mut Transaction<'static, Postgres>,
    session_id: Uuid,
    kind: UltraKind,
) -> PortResult<ProcessingMetadata> {
    sqlx::query(
        "INSERT INTO processing_metadata (study_session_id, kind, status) VALUES ($1, $2, $3) \
         ON CONFLICT (study_session_id, kind) DO NOTHING",
    )
    .bind(session_id)
    .bind(kind.as_str())
    .bind(JobStatus::NotStarted.as_str())
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;

    sqlx::query_as::<_, ProcessingRecord>(&format!(
        "SELECT {} FROM processing_metadata WHERE study_session_id = $1 AND kind = $2 FOR UPDATE",
        PROCESSING_COLUMNS
    ))
    .bind(session_id)
    .bind(kind.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(map_sqlx_error)?
    .to_domain()
}

async fn write_processing(
    tx: &mut Transaction<'static, Postgres>,
    session_id: Uuid,
    meta: &ProcessingMetadata,
) -> PortResult<()> {
    sqlx::query(
        "UPDATE processing_metadata SET status = $3, current_section = $4, total_sections = $5, \
         estimated_completion = $6, last_error = $7, updated_at = $8 \
         WHERE study_session_id = $1 AND kind = $2",
    )
    .bind(session_id)
    .bind(meta.kind.as_str())
    .bind(meta.status.as_str())
    .bind(meta.current_section as i32)
    .bind(meta.total_sections as i32)
    .bind(meta.estimated_completion)
    .bind(meta.last_error.as_deref())
    .bind(meta.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn commit(tx: Transaction<'static, Postgres>) -> PortResult<()> {
    tx.commit().await.map_err(map_sqlx_error)
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    // --- Accounts ---

    async fn create_account(
        &self,
        email: &str,
        hashed_password: &str,
        starting_balance: i64,
    ) -> PortResult<Account> {
        let mut tx = self.begin().await?;
        let record = sqlx::query_as::<_, AccountRecord>(&format!(
            "INSERT INTO accounts (id, email, hashed_password, balance) VALUES ($1, $2, $3, $4) \
             RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(hashed_password)
        .bind(starting_balance)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match map_sqlx_error(e) {
            PortError::Conflict(_) => {
                PortError::Conflict(format!("email {} already registered", email))
            }
            other => other,
        })?;
        if starting_balance > 0 {
            append_ledger_entry(&mut tx, record.id, LedgerEntryKind::Welcome, starting_balance)
                .await?;
        }
        commit(tx).await?;
        Ok(record.to_domain())
    }

    async fn get_account(&self, account_id: Uuid) -> PortResult<Account> {
        sqlx::query_as::<_, AccountRecord>(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .map(AccountRecord::to_domain)
        .ok_or_else(|| PortError::NotFound(format!("account {}", account_id)))
    }

    async fn get_credentials_by_email(&self, email: &str) -> PortResult<AccountCredentials> {
        let record = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT id, email, hashed_password FROM accounts WHERE LOWER(email) = LOWER($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| PortError::NotFound(format!("account {}", email)))?;
        Ok(AccountCredentials {
            account_id: record.id,
            email: record.email,
            hashed_password: record.hashed_password,
        })
    }

    // --- Auth Sessions ---

    async fn create_auth_session(
        &self,
        token: &str,
        account_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (token, account_id, expires_at) VALUES ($1, $2, $3)")
            .bind(token)
            .bind(account_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn resolve_auth_session(&self, token: &str) -> PortResult<AuthContext> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT a.id, a.email FROM auth_sessions s JOIN accounts a ON a.id = s.account_id \
             WHERE s.token = $1 AND s.expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        let (account_id, email) = row.ok_or(PortError::Unauthorized)?;
        Ok(AuthContext { account_id, email })
    }

    async fn delete_auth_session(&self, token: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    // --- Credit Ledger ---

    async fn try_debit(
        &self,
        account_id: Uuid,
        kind: OperationKind,
        cost: i64,
    ) -> PortResult<DebitOutcome> {
        let mut tx = self.begin().await?;
        let debited: Option<i64> = sqlx::query_scalar(
            "UPDATE accounts SET balance = balance - $2 WHERE id = $1 AND balance >= $2 \
             RETURNING balance",
        )
        .bind(account_id)
        .bind(cost)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        match debited {
            Some(new_balance) => {
                append_ledger_entry(&mut tx, account_id, LedgerEntryKind::Operation(kind), -cost)
                    .await?;
                commit(tx).await?;
                Ok(DebitOutcome::Debited { new_balance })
            }
            None => {
                let available: Option<i64> =
                    sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
                        .bind(account_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(map_sqlx_error)?;
                let available = available
                    .ok_or_else(|| PortError::NotFound(format!("account {}", account_id)))?;
                Ok(DebitOutcome::Insufficient {
                    required: cost,
                    available,
                })
            }
        }
    }

    async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: LedgerEntryKind,
    ) -> PortResult<i64> {
        let mut tx = self.begin().await?;
        let balance = add_credits(&mut tx, account_id, amount, kind).await?;
        commit(tx).await?;
        Ok(balance)
    }

    async fn credit_payment(&self, event: &PaymentEvent, amount: i64) -> PortResult<Option<i64>> {
        let mut tx = self.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO payment_events (event_id, provider, account_id, plan, credits) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&event.event_id)
        .bind(event.provider.as_str())
        .bind(event.account_id)
        .bind(event.plan.as_str())
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();
        if inserted == 0 {
            return Ok(None);
        }
        let balance = add_credits(
            &mut tx,
            event.account_id,
            amount,
            LedgerEntryKind::Purchase(event.plan),
        )
        .await?;
        commit(tx).await?;
        Ok(Some(balance))
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> PortResult<Vec<CreditTransaction>> {
        sqlx::query_as::<_, TransactionRecord>(
            "SELECT id, account_id, kind, delta, created_at FROM credit_transactions \
             WHERE account_id = $1 ORDER BY seq DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .into_iter()
        .map(TransactionRecord::to_domain)
        .collect()
    }

    async fn claim_free_oral_exam(&self, account_id: Uuid) -> PortResult<bool> {
        let claimed = sqlx::query(
            "UPDATE accounts SET free_oral_exam_used = TRUE \
             WHERE id = $1 AND NOT free_oral_exam_used",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();
        if claimed == 1 {
            return Ok(true);
        }
        // Distinguishes "already used" from an unknown account.
        self.get_account(account_id).await?;
        Ok(false)
    }

    async fn release_free_oral_exam(&self, account_id: Uuid) -> PortResult<()> {
        sqlx::query("UPDATE accounts SET free_oral_exam_used = FALSE WHERE id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    // --- Study Sessions ---

    async fn create_study_session(
        &self,
        account_id: Uuid,
        title: &str,
        language: &str,
        document_text: &str,
    ) -> PortResult<StudySession> {
        sqlx::query_as::<_, StudySessionRecord>(&format!(
            "INSERT INTO study_sessions (id, account_id, title, language, document_text) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            STUDY_SESSION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(title)
        .bind(language)
        .bind(document_text)
        .fetch_one(&self.pool)
        .await
        .map(StudySessionRecord::to_domain)
        .map_err(map_sqlx_error)
    }

    async fn get_study_session(&self, session_id: Uuid) -> PortResult<StudySession> {
        sqlx::query_as::<_, StudySessionRecord>(&format!(
            "SELECT {} FROM study_sessions WHERE id = $1",
            STUDY_SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .map(StudySessionRecord::to_domain)
        .ok_or_else(|| PortError::NotFound(format!("study session {}", session_id)))
    }

    async fn list_study_sessions(&self, account_id: Uuid) -> PortResult<Vec<StudySessionSummary>> {
        let records = sqlx::query_as::<_, StudySessionSummaryRecord>(
            "SELECT id, title, language, char_length(document_text) AS document_chars, created_at \
             FROM study_sessions WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(records
            .into_iter()
            .map(StudySessionSummaryRecord::to_domain)
            .collect())
    }

    async fn save_artifact(&self, session_id: Uuid, patch: ArtifactPatch) -> PortResult<()> {
        // `field()` is a fixed set of column names, never user input.
        let updated = sqlx::query(&format!(
            "UPDATE study_sessions SET {} = $2 WHERE id = $1",
            patch.field()
        ))
        .bind(session_id)
        .bind(patch.to_json())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();
        if updated == 0 {
            return Err(PortError::NotFound(format!("study session {}", session_id)));
        }
        Ok(())
    }

    // --- Processing Metadata ---

    async fn get_processing(
        &self,
        session_id: Uuid,
        kind: UltraKind,
    ) -> PortResult<ProcessingMetadata> {
        let record = sqlx::query_as::<_, ProcessingRecord>(&format!(
            "SELECT {} FROM processing_metadata WHERE study_session_id = $1 AND kind = $2",
            PROCESSING_COLUMNS
        ))
        .bind(session_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match record {
            Some(record) => record.to_domain(),
            None => Ok(ProcessingMetadata::new(kind)),
        }
    }

    async fn list_processing(&self, session_id: Uuid) -> PortResult<Vec<ProcessingMetadata>> {
        let stored = sqlx::query_as::<_, ProcessingRecord>(&format!(
            "SELECT {} FROM processing_metadata WHERE study_session_id = $1",
            PROCESSING_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .into_iter()
        .map(ProcessingRecord::to_domain)
        .collect::<PortResult<Vec<_>>>()?;

        Ok(UltraKind::ALL
            .into_iter()
            .map(|kind| {
                stored
                    .iter()
                    .find(|meta| meta.kind == kind)
                    .cloned()
                    .unwrap_or_else(|| ProcessingMetadata::new(kind))
            })
            .collect())
    }

    async fn update_processing(
        &self,
        session_id: Uuid,
        kind: UltraKind,
        patch: ProcessingPatch,
    ) -> PortResult<ProcessingMetadata> {
        let mut tx = self.begin().await?;
        let mut meta = lock_processing(&mut tx, session_id, kind).await?;
        meta.apply(patch)
            .map_err(|e| PortError::Conflict(e.to_string()))?;
        write_processing(&mut tx, session_id, &meta).await?;
        commit(tx).await?;
        Ok(meta)
    }

    // --- Ultra Jobs ---

    async fn enqueue_ultra_job(
        &self,
        session_id: Uuid,
        account_id: Uuid,
        kind: UltraKind,
        debited: i64,
    ) -> PortResult<UltraJob> {
        let mut tx = self.begin().await?;
        // The processing row lock serialises concurrent submissions for this kind.
        let meta = lock_processing(&mut tx, session_id, kind).await?;

        let active: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM ultra_jobs WHERE study_session_id = $1 AND kind = $2 \
             AND state IN ('queued', 'running') LIMIT 1",
        )
        .bind(session_id)
        .bind(kind.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        if active.is_some() {
            return Err(PortError::Conflict(format!(
                "an ultra {} job is already active",
                kind.as_str()
            )));
        }
        match meta.status {
            JobStatus::Completed => {
                return Err(PortError::Conflict(format!(
                    "ultra {} already completed",
                    kind.as_str()
                )))
            }
            JobStatus::Failed => {
                write_processing(&mut tx, session_id, &ProcessingMetadata::new(kind)).await?
            }
            _ => {}
        }

        let job = sqlx::query_as::<_, UltraJobRecord>(&format!(
            "INSERT INTO ultra_jobs (id, study_session_id, account_id, kind, state, debited) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            ULTRA_JOB_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(account_id)
        .bind(kind.as_str())
        .bind(UltraJobState::Queued.as_str())
        .bind(debited)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .to_domain()?;
        commit(tx).await?;
        Ok(job)
    }

    async fn claim_next_ultra_job(&self, lease: Duration) -> PortResult<Option<UltraJob>> {
        let lease_secs = lease.num_milliseconds() as f64 / 1000.0;
        let record = sqlx::query_as::<_, UltraJobRecord>(&format!(
            "UPDATE ultra_jobs SET state = 'running', attempts = attempts + 1, \
             lease_expires_at = NOW() + make_interval(secs => $1) \
             WHERE id = ( \
                 SELECT id FROM ultra_jobs \
                 WHERE state = 'queued' OR (state = 'running' AND lease_expires_at <= NOW()) \
                 ORDER BY created_at LIMIT 1 FOR UPDATE SKIP LOCKED \
             ) RETURNING {}",
            ULTRA_JOB_COLUMNS
        ))
        .bind(lease_secs)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        record.map(UltraJobRecord::to_domain).transpose()
    }

    async fn renew_ultra_job_lease(
        &self,
        job_id: Uuid,
        attempt: u32,
        lease: Duration,
    ) -> PortResult<bool> {
        let lease_secs = lease.num_milliseconds() as f64 / 1000.0;
        let renewed = sqlx::query(
            "UPDATE ultra_jobs SET lease_expires_at = NOW() + make_interval(secs => $3) \
             WHERE id = $1 AND attempts = $2 AND state = 'running'",
        )
        .bind(job_id)
        .bind(attempt as i32)
        .bind(lease_secs)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();
        Ok(renewed == 1)
    }

    async fn finish_ultra_job(&self, job_id: Uuid, state: UltraJobState) -> PortResult<bool> {
        let updated = sqlx::query(
            "UPDATE ultra_jobs SET state = $2, lease_expires_at = NULL \
             WHERE id = $1 AND state IN ('queued', 'running')",
        )
        .bind(job_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();
        if updated == 1 {
            return Ok(true);
        }
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM ultra_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("ultra job {}", job_id))),
        }
    }

    async fn save_section_result(&self, result: SectionResult) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO ultra_section_results (job_id, section_index, content, placeholder) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (job_id, section_index) \
             DO UPDATE SET content = EXCLUDED.content, placeholder = EXCLUDED.placeholder",
        )
        .bind(result.job_id)
        .bind(result.index as i32)
        .bind(&result.content)
        .bind(result.placeholder)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_section_results(&self, job_id: Uuid) -> PortResult<Vec<SectionResult>> {
        let records = sqlx::query_as::<_, SectionResultRecord>(
            "SELECT job_id, section_index, content, placeholder FROM ultra_section_results \
             WHERE job_id = $1 ORDER BY section_index",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(records
            .into_iter()
            .map(SectionResultRecord::to_domain)
            .collect())
    }

    // --- Oral Exams ---

    async fn create_oral_exam(&self, exam: &OralExamSession) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO oral_exams (id, account_id, study_session_id, mode, status, turns, free, \
             final_evaluation, final_score, revision, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(exam.id)
        .bind(exam.account_id)
        .bind(exam.study_session_id)
        .bind(exam.mode.as_str())
        .bind(exam.status.as_str())
        .bind(Json(&exam.turns))
        .bind(exam.free)
        .bind(exam.final_evaluation.as_deref())
        .bind(exam.final_score.map(i16::from))
        .bind(exam.revision)
        .bind(exam.created_at)
        .bind(exam.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_oral_exam(&self, exam_id: Uuid) -> PortResult<OralExamSession> {
        sqlx::query_as::<_, OralExamRecord>(&format!(
            "SELECT {} FROM oral_exams WHERE id = $1",
            ORAL_EXAM_COLUMNS
        ))
        .bind(exam_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| PortError::NotFound(format!("oral exam {}", exam_id)))?
        .to_domain()
    }

    async fn save_oral_exam(
        &self,
        exam: &OralExamSession,
        expected_revision: i64,
    ) -> PortResult<()> {
        let updated = sqlx::query(
            "UPDATE oral_exams SET status = $2, turns = $3, free = $4, final_evaluation = $5, \
             final_score = $6, updated_at = $7, revision = $9 \
             WHERE id = $1 AND revision = $8",
        )
        .bind(exam.id)
        .bind(exam.status.as_str())
        .bind(Json(&exam.turns))
        .bind(exam.free)
        .bind(exam.final_evaluation.as_deref())
        .bind(exam.final_score.map(i16::from))
        .bind(exam.updated_at)
        .bind(expected_revision)
        .bind(exam.revision)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();
        if updated == 1 {
            return Ok(());
        }
        let stored = self.get_oral_exam(exam.id).await?;
        Err(PortError::Conflict(format!(
            "oral exam {} changed concurrently (revision {}, expected {})",
            exam.id, stored.revision, expected_revision
        )))
    }
}
