//! The Ultra pipeline: section-by-section generation for documents too large
//! for one request.
//!
//! A job is a durable record claimed by a worker under a lease. The runner only
//! talks to `DatabaseService`, so whatever executes it (the api worker, a test,
//! a one-off command) sees the same behaviour. Progress goes through
//! `update_processing`, which refuses any patch that would move it backwards.
//! Each finished section is persisted, so a job reclaimed after its worker died
//! resumes where it stopped. The lease is renewed before every section; a
//! runner that finds its claim taken over stops without touching the job.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ascii::is_italian;
use crate::credits::{CreditLedger, LedgerError};
use crate::domain::{
    ArtifactKind, ArtifactPatch, AuthContext, ConceptMap, ConceptNode, JobStatus, NodeKind,
    ProcessingPatch, SectionResult, StudySession, SummaryArtifact, UltraJob, UltraJobState,
    UltraKind,
};
use crate::generators::{Artifact, ArtifactGenerator, GenerationRequest};
use crate::ports::{DatabaseService, PortError};
use crate::retry::RetryPolicy;
use crate::splitter;

/// A job claimed more often than this is failed instead of run again.
pub const MAX_JOB_ATTEMPTS: u32 = 3;
/// Merged concept maps keep at most this many nodes per category.
pub const MAX_NODES_PER_CATEGORY: usize = 25;
const MAX_RELATED: usize = 5;
/// Words shorter than this are not used to cross-link concept-map nodes.
const MIN_KEYWORD_CHARS: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct UltraSettings {
    /// Pause between two model calls, to stay under upstream rate limits.
    pub section_delay: Duration,
    /// A section whose model call takes longer is replaced by a placeholder.
    pub section_timeout: Duration,
    /// Used for the estimated completion time shown to pollers.
    pub estimated_section_time: Duration,
    /// How long a claim stays valid without renewal. Must exceed
    /// `section_delay + section_timeout`.
    pub job_lease: Duration,
}

impl Default for UltraSettings {
    fn default() -> Self {
        Self {
            section_delay: Duration::from_secs(2),
            section_timeout: Duration::from_secs(120),
            estimated_section_time: Duration::from_secs(20),
            job_lease: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UltraError {
    #[error("study session {0} not found")]
    SessionNotFound(Uuid),
    #[error("study session {0} has no document text")]
    MissingDocument(Uuid),
    #[error("job abandoned after {0} attempts")]
    AttemptsExhausted(u32),
    #[error("ultra job {0} was reclaimed by another worker")]
    LeaseLost(Uuid),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Port(#[from] PortError),
}

#[derive(Clone)]
pub struct UltraRunner {
    db: Arc<dyn DatabaseService>,
    generator: ArtifactGenerator,
    ledger: CreditLedger,
    settings: UltraSettings,
    retry: RetryPolicy,
}

impl UltraRunner {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        generator: ArtifactGenerator,
        ledger: CreditLedger,
        settings: UltraSettings,
    ) -> Self {
        Self {
            db,
            generator,
            ledger,
            settings,
            retry: RetryPolicy::default(),
        }
    }

    /// Overrides the policy used for store writes while a job runs.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Debits the Ultra price and queues a durable job for the worker.
    /// The debit is returned if the job cannot be queued.
    pub async fn submit(
        &self,
        ctx: &AuthContext,
        session_id: Uuid,
        kind: UltraKind,
    ) -> Result<UltraJob, UltraError> {
        let session = self.load_session(session_id).await?;
        if session.account_id != ctx.account_id {
            return Err(UltraError::SessionNotFound(session_id));
        }
        if session.document_text.trim().is_empty() {
            return Err(UltraError::MissingDocument(session_id));
        }
        let progress = self.db.get_processing(session_id, kind).await?;
        if matches!(progress.status, JobStatus::InProgress | JobStatus::Completed) {
            return Err(PortError::Conflict(format!(
                "ultra {} is already {}",
                kind.as_str(),
                progress.status.as_str()
            ))
            .into());
        }

        let debit = self
            .ledger
            .check_and_debit(ctx.account_id, kind.operation())
            .await?;
        match self
            .db
            .enqueue_ultra_job(session_id, ctx.account_id, kind, debit.amount)
            .await
        {
            Ok(job) => {
                info!(
                    "Queued ultra {} job {} for study session {}",
                    kind.as_str(),
                    job.id,
                    session_id
                );
                Ok(job)
            }
            Err(e) => {
                warn!("Could not queue ultra {} job: {}. Refunding", kind.as_str(), e);
                self.ledger
                    .refund(ctx.account_id, debit.kind, debit.amount)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Runs a claimed job to completion or failure.
    ///
    /// Per-section failures become placeholders and do not fail the job. A lost
    /// lease leaves the job to whoever holds it now. Any other error marks the
    /// processing row `failed`, fails the job record, refunds the debit once,
    /// and is returned to the caller.
    pub async fn run(&self, job: &UltraJob) -> Result<(), UltraError> {
        let outcome = if job.attempts > MAX_JOB_ATTEMPTS {
            Err(UltraError::AttemptsExhausted(job.attempts - 1))
        } else {
            self.execute(job).await
        };

        match outcome {
            Ok(()) => {
                self.db
                    .finish_ultra_job(job.id, UltraJobState::Completed)
                    .await?;
                info!("Ultra job {} completed", job.id);
                Ok(())
            }
            Err(e @ UltraError::LeaseLost(_)) => {
                warn!("Stopping ultra job {}: {}", job.id, e);
                Err(e)
            }
            Err(e) => {
                error!("Ultra job {} failed: {}", job.id, e);
                self.fail(job, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn renew_lease(&self, job: &UltraJob) -> Result<(), UltraError> {
        let lease = chrono::Duration::from_std(self.settings.job_lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let held = self
            .retry
            .run("renew ultra job lease", || {
                self.db.renew_ultra_job_lease(job.id, job.attempts, lease)
            })
            .await?;
        if held {
            Ok(())
        } else {
            Err(UltraError::LeaseLost(job.id))
        }
    }

    async fn record_progress(
        &self,
        session_id: Uuid,
        kind: UltraKind,
        patch: ProcessingPatch,
    ) -> Result<(), UltraError> {
        self.retry
            .run("update ultra progress", || {
                self.db.update_processing(session_id, kind, patch.clone())
            })
            .await?;
        Ok(())
    }

    async fn execute(&self, job: &UltraJob) -> Result<(), UltraError> {
        self.renew_lease(job).await?;
        let session = self.load_session(job.study_session_id).await?;
        if session.document_text.trim().is_empty() {
            return Err(UltraError::MissingDocument(session.id));
        }

        let sections = splitter::split(&session.document_text, session.document_chars());
        let total = sections.len() as u32;
        let mut finished: HashMap<u32, SectionResult> = self
            .db
            .get_section_results(job.id)
            .await?
            .into_iter()
            .map(|result| (result.index, result))
            .collect();
        let pending = sections.len().saturating_sub(finished.len());

        // The denominator is published before any section is touched.
        self.record_progress(
            session.id,
            job.kind,
            ProcessingPatch::started(total, self.eta(pending)),
        )
        .await?;
        if !finished.is_empty() {
            info!(
                "Resuming ultra job {} with {}/{} sections already done",
                job.id,
                finished.len(),
                total
            );
        }

        let mut contributions = Vec::with_capacity(sections.len());
        let mut called_model = false;
        for (i, text) in sections.iter().enumerate() {
            let index = i as u32 + 1;
            if let Some(done) = finished.remove(&index) {
                contributions.push(done);
                continue;
            }
            if called_model {
                tokio::time::sleep(self.settings.section_delay).await;
            }
            self.renew_lease(job).await?;
            self.record_progress(
                session.id,
                job.kind,
                ProcessingPatch::working_on(index, self.eta((total - index + 1) as usize)),
            )
            .await?;

            let result = self.process_section(job, &session, text, index, total).await;
            called_model = true;
            self.retry
                .run("save ultra section", || {
                    self.db.save_section_result(result.clone())
                })
                .await?;
            contributions.push(result);
        }

        self.renew_lease(job).await?;
        let merged = merge(job.kind, &session, &contributions);
        self.retry
            .run("save ultra artifact", || {
                self.db.save_artifact(session.id, merged.clone())
            })
            .await?;
        self.record_progress(session.id, job.kind, ProcessingPatch::completed(total))
            .await?;
        Ok(())
    }

    async fn process_section(
        &self,
        job: &UltraJob,
        session: &StudySession,
        text: &str,
        index: u32,
        total: u32,
    ) -> SectionResult {
        let req = GenerationRequest::for_section(
            section_artifact(job.kind),
            text,
            &session.language,
            index,
            total,
        );
        let (content, placeholder) = match job.kind {
            UltraKind::Summary => self.section_content::<SummaryArtifact>(&req).await,
            UltraKind::ConceptMap => self.section_content::<ConceptMap>(&req).await,
        };
        SectionResult {
            job_id: job.id,
            index,
            content,
            placeholder,
        }
    }

    /// Generates one section, substituting a placeholder on any failure.
    async fn section_content<A: Artifact>(
        &self,
        req: &GenerationRequest<'_>,
    ) -> (serde_json::Value, bool) {
        let (index, total) = req.section.unwrap_or((0, 0));
        let generated = tokio::time::timeout(
            self.settings.section_timeout,
            self.generator.try_generate::<A>(req),
        )
        .await;
        let failure = match generated {
            Ok(Ok(artifact)) => match serde_json::to_value(&artifact) {
                Ok(value) => return (value, false),
                Err(e) => e.to_string(),
            },
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.settings.section_timeout),
        };
        warn!(
            "Section {}/{} failed ({}); using a placeholder",
            index, total, failure
        );
        let placeholder = serde_json::to_value(A::placeholder(req)).unwrap_or_default();
        (placeholder, true)
    }

    async fn fail(&self, job: &UltraJob, message: &str) {
        if let Err(e) = self
            .db
            .update_processing(job.study_session_id, job.kind, ProcessingPatch::failed(message))
            .await
        {
            error!("Could not record failure of ultra job {}: {}", job.id, e);
        }
        match self.db.finish_ultra_job(job.id, UltraJobState::Failed).await {
            Ok(true) => {
                if let Err(e) = self
                    .ledger
                    .refund(job.account_id, job.kind.operation(), job.debited)
                    .await
                {
                    error!("Refund for ultra job {} failed: {}", job.id, e);
                }
            }
            Ok(false) => {}
            Err(e) => error!("Could not close ultra job {}: {}", job.id, e),
        }
    }

    async fn load_session(&self, session_id: Uuid) -> Result<StudySession, UltraError> {
        match self.db.get_study_session(session_id).await {
            Ok(session) => Ok(session),
            Err(PortError::NotFound(_)) => Err(UltraError::SessionNotFound(session_id)),
            Err(e) => Err(e.into()),
        }
    }

    fn eta(&self, remaining_sections: usize) -> chrono::DateTime<Utc> {
        let per_section = self.settings.estimated_section_time + self.settings.section_delay;
        let remaining = per_section.saturating_mul(remaining_sections as u32);
        Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

fn section_artifact(kind: UltraKind) -> ArtifactKind {
    match kind {
        UltraKind::Summary => ArtifactKind::Summary,
        UltraKind::ConceptMap => ArtifactKind::ConceptMap,
    }
}

fn merge(kind: UltraKind, session: &StudySession, contributions: &[SectionResult]) -> ArtifactPatch {
    match kind {
        UltraKind::Summary => ArtifactPatch::UltraSummary(merge_summaries(session, contributions)),
        UltraKind::ConceptMap => {
            ArtifactPatch::UltraConceptMap(merge_concept_maps(session, contributions))
        }
    }
}

fn section_label(italian: bool) -> &'static str {
    if italian {
        "Sezione"
    } else {
        "Section"
    }
}

/// Concatenates section summaries under one heading each, placeholders included.
fn merge_summaries(session: &StudySession, contributions: &[SectionResult]) -> SummaryArtifact {
    let label = section_label(is_italian(&session.language));
    let parts: Vec<String> = contributions
        .iter()
        .map(|section| {
            let (title, content) =
                match serde_json::from_value::<SummaryArtifact>(section.content.clone()) {
                    Ok(summary) => (summary.title, summary.content),
                    Err(_) => (String::new(), String::new()),
                };
            format!("## {} {}: {}\n\n{}", label, section.index, title, content.trim())
        })
        .collect();

    SummaryArtifact {
        title: session.title.clone(),
        content: parts.join("\n\n"),
        placeholder: contributions.iter().all(|section| section.placeholder),
    }
}

fn category_title(kind: NodeKind, italian: bool) -> &'static str {
    match (kind, italian) {
        (NodeKind::Concept, true) => "Concetti",
        (NodeKind::Concept, false) => "Concepts",
        (NodeKind::Definition, true) => "Definizioni",
        (NodeKind::Definition, false) => "Definitions",
        (NodeKind::Formula, true) => "Formule",
        (NodeKind::Formula, false) => "Formulas",
        (NodeKind::Example, true) => "Esempi",
        (NodeKind::Example, false) => "Examples",
        (NodeKind::Process, true) => "Processi",
        (NodeKind::Process, false) => "Processes",
        (NodeKind::Law, true) => "Leggi",
        (NodeKind::Law, false) => "Laws",
        (NodeKind::Theory, true) => "Teorie",
        (NodeKind::Theory, false) => "Theories",
    }
}

/// Lowercase alphanumerics only, so "Entropia " and "entropia" are one node.
fn normalized_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Folds `other` into `node`: the richer description and the higher priority
/// win, and children are unioned by title.
fn absorb(node: &mut ConceptNode, other: ConceptNode) {
    let other_description = other.description.unwrap_or_default();
    if other_description.len() > node.description.as_deref().map_or(0, str::len) {
        node.description = Some(other_description);
    }
    node.priority = node.priority.min(other.priority);
    for child in other.children {
        let key = normalized_title(&child.title);
        if !node
            .children
            .iter()
            .any(|existing| normalized_title(&existing.title) == key)
        {
            node.children.push(child);
        }
    }
}

/// Deduplicates the section maps' top-level nodes, groups them by type into
/// named categories and links nodes that share a keyword.
fn merge_concept_maps(session: &StudySession, contributions: &[SectionResult]) -> ConceptMap {
    let italian = is_italian(&session.language);
    let mut unique: Vec<ConceptNode> = Vec::new();
    let mut index_by_title: HashMap<String, usize> = HashMap::new();
    let mut skipped = Vec::new();

    for section in contributions {
        let map = match serde_json::from_value::<ConceptMap>(section.content.clone()) {
            Ok(map) if !section.placeholder && !map.placeholder => map,
            _ => {
                skipped.push(section.index.to_string());
                continue;
            }
        };
        let nodes = if map.root.children.is_empty() {
            vec![map.root]
        } else {
            map.root.children
        };
        for node in nodes {
            let key = normalized_title(&node.title);
            if key.is_empty() {
                continue;
            }
            match index_by_title.get(&key) {
                Some(&i) => absorb(&mut unique[i], node),
                None => {
                    index_by_title.insert(key, unique.len());
                    unique.push(node);
                }
            }
        }
    }

    let mut categories: BTreeMap<NodeKind, Vec<ConceptNode>> = BTreeMap::new();
    for node in unique {
        categories.entry(node.kind).or_default().push(node);
    }
    for nodes in categories.values_mut() {
        nodes.sort_by_key(|node| node.priority);
        nodes.truncate(MAX_NODES_PER_CATEGORY);
    }
    cross_link(&mut categories);

    let mut root = ConceptNode::new(session.title.clone(), NodeKind::Concept);
    if !skipped.is_empty() {
        root.description = Some(format!(
            "{}: {}",
            if italian {
                "Sezioni non elaborate"
            } else {
                "Sections not processed"
            },
            skipped.join(", ")
        ));
    }
    root.children = categories
        .into_iter()
        .map(|(kind, nodes)| {
            let mut category = ConceptNode::new(category_title(kind, italian), kind);
            category.children = nodes;
            category
        })
        .collect();

    let placeholder = root.children.is_empty();
    ConceptMap { root, placeholder }
}

fn keywords(node: &ConceptNode) -> Vec<String> {
    let text = format!(
        "{} {}",
        node.title,
        node.description.as_deref().unwrap_or_default()
    );
    let mut words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS)
        .map(str::to_lowercase)
        .collect();
    words.sort();
    words.dedup();
    words
}

fn cross_link(categories: &mut BTreeMap<NodeKind, Vec<ConceptNode>>) {
    let nodes: Vec<(String, Vec<String>)> = categories
        .values()
        .flatten()
        .map(|node| (node.title.clone(), keywords(node)))
        .collect();

    for node in categories.values_mut().flatten() {
        let own = keywords(node);
        node.related = nodes
            .iter()
            .filter(|(title, _)| *title != node.title)
            .filter(|(_, words)| words.iter().any(|w| own.binary_search(w).is_ok()))
            .map(|(title, _)| title.clone())
            .take(MAX_RELATED)
            .collect();
    }
}
