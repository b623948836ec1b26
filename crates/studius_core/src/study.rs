//! Paid one-shot operations over a study session: artifact generation and
//! the tutor.
//!
//! Each call debits first and either delivers or refunds. Callers that can be
//! cancelled mid-call (an HTTP handler whose client went away) should run
//! these on a detached task so the debit is never left half-settled.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::credits::{CreditLedger, LedgerError};
use crate::domain::{ArtifactKind, AuthContext, OperationKind, StudySession};
use crate::generators::ArtifactGenerator;
use crate::ports::{DatabaseService, PortError};
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum StudyError {
    #[error("study session {0} not found")]
    NotFound(Uuid),
    #[error("the study session has no document text")]
    MissingDocument,
    #[error("the question is empty")]
    EmptyQuestion,
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },
    #[error(transparent)]
    Port(#[from] PortError),
}

impl From<LedgerError> for StudyError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => StudyError::InsufficientCredits {
                required,
                available,
            },
            LedgerError::Port(e) => StudyError::Port(e),
        }
    }
}

/// A stored artifact and the balance left after paying for it.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub kind: ArtifactKind,
    pub artifact: serde_json::Value,
    pub placeholder: bool,
    pub balance: i64,
}

#[derive(Debug, Clone)]
pub struct TutorReply {
    pub answer: String,
    pub placeholder: bool,
    pub balance: i64,
}

#[derive(Clone)]
pub struct StudyService {
    db: Arc<dyn DatabaseService>,
    generator: ArtifactGenerator,
    ledger: CreditLedger,
    retry: RetryPolicy,
}

impl StudyService {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        generator: ArtifactGenerator,
        ledger: CreditLedger,
    ) -> Self {
        Self {
            db,
            generator,
            ledger,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Generates `kind` over the session document and stores it.
    ///
    /// A model failure stores a placeholder and keeps the charge. If nothing
    /// can be stored the debit is refunded.
    pub async fn generate_artifact(
        &self,
        ctx: &AuthContext,
        session_id: Uuid,
        kind: ArtifactKind,
    ) -> Result<GeneratedArtifact, StudyError> {
        let session = self.readable_session(ctx, session_id).await?;
        let debit = self
            .ledger
            .check_and_debit(ctx.account_id, kind.operation())
            .await?;

        let patch = self.generator.generate_patch(kind, &session).await;
        let artifact = patch.to_json();
        let placeholder = artifact
            .get("placeholder")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let saved = self
            .retry
            .run("save artifact", || {
                self.db.save_artifact(session.id, patch.clone())
            })
            .await;
        if let Err(e) = saved {
            warn!(
                "Could not store {} for study session {}: {}. Refunding",
                kind.slug(),
                session.id,
                e
            );
            self.ledger
                .refund(ctx.account_id, debit.kind, debit.amount)
                .await?;
            return Err(e.into());
        }
        info!(
            "Stored {} for study session {}{}",
            kind.slug(),
            session.id,
            if placeholder { " (placeholder)" } else { "" }
        );

        Ok(GeneratedArtifact {
            kind,
            artifact,
            placeholder,
            balance: debit.new_balance,
        })
    }

    /// Answers a question about the session document. The charge stands even
    /// when the answer is a placeholder.
    pub async fn ask_tutor(
        &self,
        ctx: &AuthContext,
        session_id: Uuid,
        question: &str,
    ) -> Result<TutorReply, StudyError> {
        if question.trim().is_empty() {
            return Err(StudyError::EmptyQuestion);
        }
        let session = self.readable_session(ctx, session_id).await?;
        let debit = self
            .ledger
            .check_and_debit(ctx.account_id, OperationKind::Tutor)
            .await?;
        let reply = self.generator.answer_question(&session, question).await;
        Ok(TutorReply {
            answer: reply.answer,
            placeholder: reply.placeholder,
            balance: debit.new_balance,
        })
    }

    /// The caller's session, with a document to work on. Other accounts'
    /// sessions read as missing.
    async fn readable_session(
        &self,
        ctx: &AuthContext,
        session_id: Uuid,
    ) -> Result<StudySession, StudyError> {
        let session = match self.db.get_study_session(session_id).await {
            Ok(session) if session.account_id == ctx.account_id => session,
            Ok(_) | Err(PortError::NotFound(_)) => return Err(StudyError::NotFound(session_id)),
            Err(e) => return Err(e.into()),
        };
        if session.document_text.trim().is_empty() {
            return Err(StudyError::MissingDocument);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::testing::ScriptedModel;

    const SUMMARY: &str = r#"{"title":"Termodinamica","content":"Il calore passa dal caldo al freddo."}"#;

    struct Fixture {
        store: Arc<InMemoryStore>,
        service: StudyService,
        ledger: CreditLedger,
        ctx: AuthContext,
        session_id: Uuid,
    }

    async fn fixture(balance: i64, model: Arc<ScriptedModel>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let account = store
            .create_account("studio@example.com", "hash", balance)
            .await
            .unwrap();
        let session = store
            .create_study_session(account.id, "Fisica", "it", "Il primo principio.")
            .await
            .unwrap();
        let ledger = CreditLedger::new(store.clone());
        let generator = ArtifactGenerator::new(model).with_retry(RetryPolicy::none());
        Fixture {
            service: StudyService::new(store.clone(), generator, ledger.clone())
                .with_retry(RetryPolicy::none()),
            ledger,
            ctx: AuthContext {
                account_id: account.id,
                email: account.email,
            },
            session_id: session.id,
            store,
        }
    }

    #[tokio::test]
    async fn generated_artifacts_are_stored_and_charged() {
        let f = fixture(100, ScriptedModel::new(|_, _| Ok(SUMMARY.to_string()))).await;

        let generated = f
            .service
            .generate_artifact(&f.ctx, f.session_id, ArtifactKind::Summary)
            .await
            .unwrap();
        assert!(!generated.placeholder);
        assert_eq!(generated.balance, 90);
        assert_eq!(generated.artifact["title"], "Termodinamica");

        let stored = f.store.get_study_session(f.session_id).await.unwrap();
        assert_eq!(stored.artifacts.summary.unwrap().title, "Termodinamica");
    }

    #[tokio::test]
    async fn an_artifact_that_cannot_be_stored_is_refunded() {
        let f = fixture(100, ScriptedModel::new(|_, _| Ok(SUMMARY.to_string()))).await;

        f.store.fail_next_artifact_writes(1);
        let err = f
            .service
            .generate_artifact(&f.ctx, f.session_id, ArtifactKind::Summary)
            .await
            .unwrap_err();
        assert!(matches!(err, StudyError::Port(PortError::Unavailable(_))));
        assert_eq!(f.ledger.balance(f.ctx.account_id).await.unwrap(), 100);
        let stored = f.store.get_study_session(f.session_id).await.unwrap();
        assert!(stored.artifacts.summary.is_none());
    }

    #[tokio::test]
    async fn a_transient_store_failure_is_retried() {
        let mut f = fixture(100, ScriptedModel::new(|_, _| Ok(SUMMARY.to_string()))).await;
        f.service = f.service.with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
        });

        f.store.fail_next_artifact_writes(1);
        f.service
            .generate_artifact(&f.ctx, f.session_id, ArtifactKind::Summary)
            .await
            .unwrap();
        assert_eq!(f.ledger.balance(f.ctx.account_id).await.unwrap(), 90);
    }

    #[tokio::test]
    async fn model_failures_are_stored_as_placeholders() {
        let f = fixture(
            100,
            ScriptedModel::new(|_, _| Err(PortError::Unavailable("overloaded".into()))),
        )
        .await;

        let generated = f
            .service
            .generate_artifact(&f.ctx, f.session_id, ArtifactKind::Quiz)
            .await
            .unwrap();
        assert!(generated.placeholder);
        assert_eq!(generated.balance, 92);
        let stored = f.store.get_study_session(f.session_id).await.unwrap();
        assert!(stored.artifacts.quiz.unwrap().placeholder);
    }

    #[tokio::test]
    async fn tutor_refuses_empty_questions_and_strangers() {
        let f = fixture(100, ScriptedModel::new(|_, _| Ok("Certo.".to_string()))).await;

        assert!(matches!(
            f.service.ask_tutor(&f.ctx, f.session_id, "  ").await,
            Err(StudyError::EmptyQuestion)
        ));
        let stranger = AuthContext {
            account_id: Uuid::new_v4(),
            email: "x@example.com".into(),
        };
        assert!(matches!(
            f.service.ask_tutor(&stranger, f.session_id, "Perche'?").await,
            Err(StudyError::NotFound(_))
        ));
        assert_eq!(f.ledger.balance(f.ctx.account_id).await.unwrap(), 100);

        let reply = f
            .service
            .ask_tutor(&f.ctx, f.session_id, "Perche'?")
            .await
            .unwrap();
        assert_eq!(reply.answer, "Certo.");
        assert_eq!(reply.balance, 95);
    }
}
