//! An in-process `DatabaseService`.
//!
//! Every operation runs under one lock, so each call is atomic the same way a
//! single SQL transaction is. Used by the test suites and for running the
//! service without Postgres. The fault switches and history below only exist
//! in test builds.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    Account, AccountCredentials, ArtifactPatch, Artifacts, AuthContext, AuthSession,
    CreditTransaction, JobStatus, LedgerEntryKind, OperationKind, OralExamSession,
    PaymentEvent, ProcessingMetadata, ProcessingPatch, SectionResult,
    StudySession, StudySessionSummary, UltraJob, UltraJobState, UltraKind,
};
use crate::ports::{DatabaseService, DebitOutcome, PortError, PortResult};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    passwords: HashMap<Uuid, String>,
    auth_sessions: HashMap<String, AuthSession>,
    transactions: Vec<CreditTransaction>,
    payment_events: HashSet<String>,
    study_sessions: HashMap<Uuid, StudySession>,
    processing: HashMap<(Uuid, UltraKind), ProcessingMetadata>,
    #[cfg(test)]
    processing_history: Vec<(Uuid, ProcessingMetadata)>,
    jobs: Vec<UltraJob>,
    section_results: HashMap<(Uuid, u32), SectionResult>,
    oral_exams: HashMap<Uuid, OralExamSession>,
}

impl State {
    fn account_mut(&mut self, account_id: Uuid) -> PortResult<&mut Account> {
        self.accounts
            .get_mut(&account_id)
            .ok_or_else(|| PortError::NotFound(format!("account {}", account_id)))
    }

    fn append(&mut self, account_id: Uuid, kind: LedgerEntryKind, delta: i64) {
        self.transactions.push(CreditTransaction {
            id: Uuid::new_v4(),
            account_id,
            kind,
            delta,
            created_at: Utc::now(),
        });
    }

    fn add_credits(
        &mut self,
        account_id: Uuid,
        amount: i64,
        kind: LedgerEntryKind,
    ) -> PortResult<i64> {
        let account = self.account_mut(account_id)?;
        account.balance += amount;
        let balance = account.balance;
        self.append(account_id, kind, amount);
        Ok(balance)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    #[cfg(test)]
    faults: Faults,
}

#[cfg(test)]
#[derive(Default)]
struct Faults {
    oral_exam_writes: AtomicBool,
    section_writes: AtomicU32,
    artifact_writes: AtomicU32,
}

#[cfg(test)]
fn take_fault(remaining: &AtomicU32, what: &str) -> PortResult<()> {
    let armed = remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if armed {
        return Err(PortError::Unavailable(format!("{} store offline", what)));
    }
    Ok(())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl InMemoryStore {
    /// Makes every oral exam write fail with `Unavailable` until reset.
    pub(crate) fn set_oral_exam_writes_failing(&self, failing: bool) {
        self.faults.oral_exam_writes.store(failing, Ordering::SeqCst);
    }

    /// Fails the next `n` section result writes with `Unavailable`.
    pub(crate) fn fail_next_section_writes(&self, n: u32) {
        self.faults.section_writes.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` artifact writes with `Unavailable`.
    pub(crate) fn fail_next_artifact_writes(&self, n: u32) {
        self.faults.artifact_writes.store(n, Ordering::SeqCst);
    }

    /// Every state the processing row of `(session_id, kind)` has gone through,
    /// in order.
    pub(crate) async fn processing_history(
        &self,
        session_id: Uuid,
        kind: UltraKind,
    ) -> Vec<ProcessingMetadata> {
        let state = self.state.lock().await;
        state
            .processing_history
            .iter()
            .filter(|(id, meta)| *id == session_id && meta.kind == kind)
            .map(|(_, meta)| meta.clone())
            .collect()
    }

    pub(crate) async fn ultra_job(&self, job_id: Uuid) -> Option<UltraJob> {
        let state = self.state.lock().await;
        state.jobs.iter().find(|job| job.id == job_id).cloned()
    }
}

impl InMemoryStore {
    fn check_oral_exam_writes(&self) -> PortResult<()> {
        #[cfg(test)]
        if self.faults.oral_exam_writes.load(Ordering::SeqCst) {
            return Err(PortError::Unavailable("oral exam store offline".into()));
        }
        Ok(())
    }

    fn check_section_writes(&self) -> PortResult<()> {
        #[cfg(test)]
        take_fault(&self.faults.section_writes, "section result")?;
        Ok(())
    }

    fn check_artifact_writes(&self) -> PortResult<()> {
        #[cfg(test)]
        take_fault(&self.faults.artifact_writes, "artifact")?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseService for InMemoryStore {
    async fn create_account(
        &self,
        email: &str,
        hashed_password: &str,
        starting_balance: i64,
    ) -> PortResult<Account> {
        let mut state = self.state.lock().await;
        if state
            .accounts
            .values()
            .any(|a| a.email.eq_ignore_ascii_case(email))
        {
            return Err(PortError::Conflict(format!("email {} already registered", email)));
        }
        let account = Account {
            id: Uuid::new_v4(),
            email: email.to_string(),
            balance: starting_balance,
            free_oral_exam_used: false,
            created_at: Utc::now(),
        };
        state.accounts.insert(account.id, account.clone());
        state
            .passwords
            .insert(account.id, hashed_password.to_string());
        if starting_balance > 0 {
            state.append(account.id, LedgerEntryKind::Welcome, starting_balance);
        }
        Ok(account)
    }

    async fn get_account(&self, account_id: Uuid) -> PortResult<Account> {
        let mut state = self.state.lock().await;
        Ok(state.account_mut(account_id)?.clone())
    }

    async fn get_credentials_by_email(&self, email: &str) -> PortResult<AccountCredentials> {
        let state = self.state.lock().await;
        let account = state
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .ok_or_else(|| PortError::NotFound(format!("account {}", email)))?;
        Ok(AccountCredentials {
            account_id: account.id,
            email: account.email.clone(),
            hashed_password: state.passwords.get(&account.id).cloned().unwrap_or_default(),
        })
    }

    async fn create_auth_session(
        &self,
        token: &str,
        account_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let mut state = self.state.lock().await;
        state.auth_sessions.insert(
            token.to_string(),
            AuthSession {
                token: token.to_string(),
                account_id,
                expires_at,
            },
        );
        Ok(())
    }

    async fn resolve_auth_session(&self, token: &str) -> PortResult<AuthContext> {
        let state = self.state.lock().await;
        let session = state
            .auth_sessions
            .get(token)
            .filter(|s| s.expires_at > Utc::now())
            .ok_or(PortError::Unauthorized)?;
        let account = state
            .accounts
            .get(&session.account_id)
            .ok_or(PortError::Unauthorized)?;
        Ok(AuthContext {
            account_id: account.id,
            email: account.email.clone(),
        })
    }

    async fn delete_auth_session(&self, token: &str) -> PortResult<()> {
        self.state.lock().await.auth_sessions.remove(token);
        Ok(())
    }

    async fn try_debit(
        &self,
        account_id: Uuid,
        kind: OperationKind,
        cost: i64,
    ) -> PortResult<DebitOutcome> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        if account.balance < cost {
            return Ok(DebitOutcome::Insufficient {
                required: cost,
                available: account.balance,
            });
        }
        account.balance -= cost;
        let new_balance = account.balance;
        state.append(account_id, LedgerEntryKind::Operation(kind), -cost);
        Ok(DebitOutcome::Debited { new_balance })
    }

    async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: LedgerEntryKind,
    ) -> PortResult<i64> {
        self.state.lock().await.add_credits(account_id, amount, kind)
    }

    async fn credit_payment(&self, event: &PaymentEvent, amount: i64) -> PortResult<Option<i64>> {
        let mut state = self.state.lock().await;
        if state.payment_events.contains(&event.event_id) {
            return Ok(None);
        }
        let balance =
            state.add_credits(event.account_id, amount, LedgerEntryKind::Purchase(event.plan))?;
        state.payment_events.insert(event.event_id.clone());
        Ok(Some(balance))
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> PortResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_free_oral_exam(&self, account_id: Uuid) -> PortResult<bool> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        if account.free_oral_exam_used {
            return Ok(false);
        }
        account.free_oral_exam_used = true;
        Ok(true)
    }

    async fn release_free_oral_exam(&self, account_id: Uuid) -> PortResult<()> {
        let mut state = self.state.lock().await;
        state.account_mut(account_id)?.free_oral_exam_used = false;
        Ok(())
    }

    async fn create_study_session(
        &self,
        account_id: Uuid,
        title: &str,
        language: &str,
        document_text: &str,
    ) -> PortResult<StudySession> {
        let session = StudySession {
            id: Uuid::new_v4(),
            account_id,
            title: title.to_string(),
            language: language.to_string(),
            document_text: document_text.to_string(),
            artifacts: Artifacts::default(),
            created_at: Utc::now(),
        };
        let mut state = self.state.lock().await;
        state.study_sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_study_session(&self, session_id: Uuid) -> PortResult<StudySession> {
        let state = self.state.lock().await;
        state
            .study_sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("study session {}", session_id)))
    }

    async fn list_study_sessions(&self, account_id: Uuid) -> PortResult<Vec<StudySessionSummary>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<StudySessionSummary> = state
            .study_sessions
            .values()
            .filter(|s| s.account_id == account_id)
            .map(|s| StudySessionSummary {
                id: s.id,
                title: s.title.clone(),
                language: s.language.clone(),
                document_chars: s.document_chars(),
                created_at: s.created_at,
            })
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn save_artifact(&self, session_id: Uuid, patch: ArtifactPatch) -> PortResult<()> {
        self.check_artifact_writes()?;
        let mut state = self.state.lock().await;
        let session = state
            .study_sessions
            .get_mut(&session_id)
            .ok_or_else(|| PortError::NotFound(format!("study session {}", session_id)))?;
        session.artifacts.apply(patch);
        Ok(())
    }

    async fn get_processing(
        &self,
        session_id: Uuid,
        kind: UltraKind,
    ) -> PortResult<ProcessingMetadata> {
        let state = self.state.lock().await;
        Ok(state
            .processing
            .get(&(session_id, kind))
            .cloned()
            .unwrap_or_else(|| ProcessingMetadata::new(kind)))
    }

    async fn list_processing(&self, session_id: Uuid) -> PortResult<Vec<ProcessingMetadata>> {
        let state = self.state.lock().await;
        Ok(UltraKind::ALL
            .into_iter()
            .map(|kind| {
                state
                    .processing
                    .get(&(session_id, kind))
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
        let mut state = self.state.lock().await;
        let meta = state
            .processing
            .entry((session_id, kind))
            .or_insert_with(|| ProcessingMetadata::new(kind));
        meta.apply(patch)
            .map_err(|e| PortError::Conflict(e.to_string()))?;
        let meta = meta.clone();
        #[cfg(test)]
        state.processing_history.push((session_id, meta.clone()));
        Ok(meta)
    }

    async fn enqueue_ultra_job(
        &self,
        session_id: Uuid,
        account_id: Uuid,
        kind: UltraKind,
        debited: i64,
    ) -> PortResult<UltraJob> {
        let mut state = self.state.lock().await;
        let active = state.jobs.iter().any(|job| {
            job.study_session_id == session_id
                && job.kind == kind
                && matches!(job.state, UltraJobState::Queued | UltraJobState::Running)
        });
        if active {
            return Err(PortError::Conflict(format!(
                "an ultra {} job is already active",
                kind.as_str()
            )));
        }
        if let Some(meta) = state.processing.get_mut(&(session_id, kind)) {
            match meta.status {
                JobStatus::Completed => {
                    return Err(PortError::Conflict(format!(
                        "ultra {} already completed",
                        kind.as_str()
                    )))
                }
                JobStatus::Failed => *meta = ProcessingMetadata::new(kind),
                _ => {}
            }
        }

        let job = UltraJob {
            id: Uuid::new_v4(),
            study_session_id: session_id,
            account_id,
            kind,
            state: UltraJobState::Queued,
            attempts: 0,
            debited,
            lease_expires_at: None,
            created_at: Utc::now(),
        };
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn claim_next_ultra_job(&self, lease: Duration) -> PortResult<Option<UltraJob>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let claimable = state.jobs.iter_mut().find(|job| match job.state {
            UltraJobState::Queued => true,
            UltraJobState::Running => job.lease_expires_at.is_some_and(|until| until <= now),
            _ => false,
        });
        Ok(claimable.map(|job| {
            job.state = UltraJobState::Running;
            job.attempts += 1;
            job.lease_expires_at = Some(now + lease);
            job.clone()
        }))
    }

    async fn renew_ultra_job_lease(
        &self,
        job_id: Uuid,
        attempt: u32,
        lease: Duration,
    ) -> PortResult<bool> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| PortError::NotFound(format!("ultra job {}", job_id)))?;
        if job.state != UltraJobState::Running || job.attempts != attempt {
            return Ok(false);
        }
        job.lease_expires_at = Some(Utc::now() + lease);
        Ok(true)
    }

    async fn finish_ultra_job(&self, job_id: Uuid, state: UltraJobState) -> PortResult<bool> {
        let mut guard = self.state.lock().await;
        let job = guard
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| PortError::NotFound(format!("ultra job {}", job_id)))?;
        if !matches!(job.state, UltraJobState::Queued | UltraJobState::Running) {
            return Ok(false);
        }
        job.state = state;
        job.lease_expires_at = None;
        Ok(true)
    }

    async fn save_section_result(&self, result: SectionResult) -> PortResult<()> {
        self.check_section_writes()?;
        let mut state = self.state.lock().await;
        state
            .section_results
            .insert((result.job_id, result.index), result);
        Ok(())
    }

    async fn get_section_results(&self, job_id: Uuid) -> PortResult<Vec<SectionResult>> {
        let state = self.state.lock().await;
        let mut results: Vec<SectionResult> = state
            .section_results
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    async fn create_oral_exam(&self, exam: &OralExamSession) -> PortResult<()> {
        self.check_oral_exam_writes()?;
        let mut state = self.state.lock().await;
        state.oral_exams.insert(exam.id, exam.clone());
        Ok(())
    }

    async fn get_oral_exam(&self, exam_id: Uuid) -> PortResult<OralExamSession> {
        let state = self.state.lock().await;
        state
            .oral_exams
            .get(&exam_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("oral exam {}", exam_id)))
    }

    async fn save_oral_exam(
        &self,
        exam: &OralExamSession,
        expected_revision: i64,
    ) -> PortResult<()> {
        self.check_oral_exam_writes()?;
        let mut state = self.state.lock().await;
        let stored = state
            .oral_exams
            .get_mut(&exam.id)
            .ok_or_else(|| PortError::NotFound(format!("oral exam {}", exam.id)))?;
        if stored.revision != expected_revision {
            return Err(PortError::Conflict(format!(
                "oral exam {} changed concurrently (revision {}, expected {})",
                exam.id, stored.revision, expected_revision
            )));
        }
        *stored = exam.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OralExamStatus;

    #[tokio::test]
    async fn expired_leases_are_reclaimed() {
        let store = InMemoryStore::new();
        let job = store
            .enqueue_ultra_job(Uuid::new_v4(), Uuid::new_v4(), UltraKind::Summary, 40)
            .await
            .unwrap();

        let first = store
            .claim_next_ultra_job(Duration::zero())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, job.id);
        assert_eq!(first.attempts, 1);

        let second = store
            .claim_next_ultra_job(Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempts, 2);
        assert!(store
            .claim_next_ultra_job(Duration::minutes(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn only_the_current_claim_renews_a_lease() {
        let store = InMemoryStore::new();
        let job = store
            .enqueue_ultra_job(Uuid::new_v4(), Uuid::new_v4(), UltraKind::Summary, 40)
            .await
            .unwrap();
        let stale = store
            .claim_next_ultra_job(Duration::zero())
            .await
            .unwrap()
            .unwrap();
        let current = store
            .claim_next_ultra_job(Duration::zero())
            .await
            .unwrap()
            .unwrap();

        assert!(!store
            .renew_ultra_job_lease(job.id, stale.attempts, Duration::minutes(30))
            .await
            .unwrap());
        assert!(store
            .renew_ultra_job_lease(job.id, current.attempts, Duration::minutes(30))
            .await
            .unwrap());
        assert!(store
            .claim_next_ultra_job(Duration::minutes(30))
            .await
            .unwrap()
            .is_none());

        store
            .finish_ultra_job(job.id, UltraJobState::Completed)
            .await
            .unwrap();
        assert!(!store
            .renew_ultra_job_lease(job.id, current.attempts, Duration::minutes(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn a_job_finishes_exactly_once() {
        let store = InMemoryStore::new();
        let job = store
            .enqueue_ultra_job(Uuid::new_v4(), Uuid::new_v4(), UltraKind::ConceptMap, 30)
            .await
            .unwrap();

        assert!(store
            .finish_ultra_job(job.id, UltraJobState::Failed)
            .await
            .unwrap());
        assert!(!store
            .finish_ultra_job(job.id, UltraJobState::Failed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn only_one_active_job_per_kind() {
        let store = InMemoryStore::new();
        let session = Uuid::new_v4();
        store
            .enqueue_ultra_job(session, Uuid::new_v4(), UltraKind::Summary, 40)
            .await
            .unwrap();

        let again = store
            .enqueue_ultra_job(session, Uuid::new_v4(), UltraKind::Summary, 40)
            .await;
        assert!(matches!(again, Err(PortError::Conflict(_))));
        store
            .enqueue_ultra_job(session, Uuid::new_v4(), UltraKind::ConceptMap, 30)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn oral_exam_saves_compare_the_stored_revision() {
        let store = InMemoryStore::new();
        let mut exam = OralExamSession::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            crate::domain::OralExamMode::Standard,
        );
        store.create_oral_exam(&exam).await.unwrap();

        exam.status = OralExamStatus::Questioning;
        exam.revision = 1;
        store.save_oral_exam(&exam, 0).await.unwrap();
        let stale = store.save_oral_exam(&exam, 0).await;
        assert!(matches!(stale, Err(PortError::Conflict(_))));
        assert_eq!(store.get_oral_exam(exam.id).await.unwrap().revision, 1);
    }
}
