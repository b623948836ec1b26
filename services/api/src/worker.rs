//! services/api/src/worker.rs
//!
//! The background worker that executes queued Ultra jobs outside the
//! request/response cycle.
//!
//! Jobs are claimed from the database under a lease. If this process goes away
//! mid-job the lease expires and any worker picks the job up again, resuming
//! from the sections already persisted.

use std::sync::Arc;
use std::time::Duration;
use studius_core::ports::{DatabaseService, PortResult};
use studius_core::{UltraError, UltraRunner};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct JobWorker {
    db: Arc<dyn DatabaseService>,
    runner: UltraRunner,
    poll_interval: Duration,
    lease: chrono::Duration,
}

impl JobWorker {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        runner: UltraRunner,
        poll_interval: Duration,
        lease: Duration,
    ) -> Self {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            db,
            runner,
            poll_interval,
            lease,
        }
    }

    /// Claims and runs at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> PortResult<bool> {
        let Some(job) = self.db.claim_next_ultra_job(self.lease).await? else {
            return Ok(false);
        };
        info!(
            "Claimed ultra {} job {} (attempt {})",
            job.kind.as_str(),
            job.id,
            job.attempts
        );
        match self.runner.run(&job).await {
            Ok(()) => info!("Ultra job {} completed", job.id),
            Err(UltraError::LeaseLost(_)) => {
                info!("Ultra job {} is now held by another worker", job.id)
            }
            Err(e) => error!("Ultra job {} failed: {}", job.id, e),
        }
        Ok(true)
    }

    /// Polls for jobs until `token` is cancelled.
    ///
    /// A job still running at shutdown is abandoned, not failed: its lease
    /// runs out and it is resumed later.
    pub async fn run(self, token: CancellationToken) {
        info!(
            "Job worker started (poll every {:?}, lease {}s)",
            self.poll_interval,
            self.lease.num_seconds()
        );
        loop {
            let claimed = tokio::select! {
                result = self.run_once() => result,
                _ = token.cancelled() => break,
            };
            let idle = match claimed {
                Ok(true) => false,
                Ok(false) => true,
                Err(e) => {
                    warn!("Could not claim an ultra job: {}", e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
        info!("Job worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use studius_core::ports::{LanguageModelService, PortError};
    use studius_core::{
        ArtifactGenerator, AuthContext, CreditLedger, InMemoryStore, JobStatus, RetryPolicy,
        UltraKind, UltraSettings,
    };

    struct SummaryModel;

    #[async_trait]
    impl LanguageModelService for SummaryModel {
        async fn complete(&self, _instructions: &str, _input: &str) -> PortResult<String> {
            Ok(r#"{"title": "Termodinamica", "content": "Il calore fluisce dal corpo caldo al freddo."}"#.to_string())
        }
    }

    struct OfflineModel;

    #[async_trait]
    impl LanguageModelService for OfflineModel {
        async fn complete(&self, _instructions: &str, _input: &str) -> PortResult<String> {
            Err(PortError::Unexpected("model offline".into()))
        }
    }

    fn worker_over(store: Arc<InMemoryStore>, llm: Arc<dyn LanguageModelService>) -> JobWorker {
        let db: Arc<dyn DatabaseService> = store;
        let ledger = CreditLedger::new(db.clone());
        let generator = ArtifactGenerator::new(llm).with_retry(RetryPolicy::none());
        let settings = UltraSettings {
            section_delay: Duration::ZERO,
            ..UltraSettings::default()
        };
        let runner = UltraRunner::new(db.clone(), generator, ledger, settings);
        JobWorker::new(db, runner, Duration::from_millis(10), Duration::from_secs(60))
    }

    async fn queued_job(store: &Arc<InMemoryStore>, worker: &JobWorker) -> AuthContext {
        let account = store
            .create_account("studente@example.com", "hash", 100)
            .await
            .unwrap();
        let session = store
            .create_study_session(
                account.id,
                "Fisica",
                "it",
                "Il primo principio della termodinamica. Il secondo principio.",
            )
            .await
            .unwrap();
        let ctx = AuthContext {
            account_id: account.id,
            email: account.email,
        };
        worker
            .runner
            .submit(&ctx, session.id, UltraKind::Summary)
            .await
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn run_once_executes_a_queued_job() {
        let store = Arc::new(InMemoryStore::new());
        let worker = worker_over(store.clone(), Arc::new(SummaryModel));
        let ctx = queued_job(&store, &worker).await;

        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());

        let sessions = store.list_study_sessions(ctx.account_id).await.unwrap();
        let session = store.get_study_session(sessions[0].id).await.unwrap();
        let merged = session.artifacts.ultra_summary.expect("merged summary");
        assert!(merged.content.contains("Il calore fluisce"));
        let progress = store
            .get_processing(session.id, UltraKind::Summary)
            .await
            .unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn model_outage_still_completes_with_placeholders() {
        let store = Arc::new(InMemoryStore::new());
        let worker = worker_over(store.clone(), Arc::new(OfflineModel));
        let ctx = queued_job(&store, &worker).await;

        assert!(worker.run_once().await.unwrap());

        let sessions = store.list_study_sessions(ctx.account_id).await.unwrap();
        let progress = store
            .get_processing(sessions[0].id, UltraKind::Summary)
            .await
            .unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
        // 100 - 40, no refund for a completed job
        assert_eq!(store.get_account(ctx.account_id).await.unwrap().balance, 60);
    }

    #[tokio::test]
    async fn cancelled_worker_stops_while_idle() {
        let store = Arc::new(InMemoryStore::new());
        let worker = worker_over(store, Arc::new(SummaryModel));
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
