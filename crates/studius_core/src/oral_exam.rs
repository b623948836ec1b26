//! The Oral Exam Session: the model plays the professor, asks questions
//! grounded in the study document, grades each answer on the 0-30 scale and
//! closes with a final evaluation.
//!
//! Exams move `idle -> questioning -> completed`; `restart` returns them to
//! `idle`. Every write is a compare-and-set on the revision the exam was read
//! at, so a retried or concurrent request cannot apply the same transition
//! twice. Answers may also name the revision the client last saw, which keeps
//! a replayed answer from landing on the next question.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ascii::is_italian;
use crate::credits::{CreditLedger, Debit, LedgerError};
use crate::domain::{
    AuthContext, OralExamMode, OralExamSession, OralExamStatus, OralExamTurn, StudySession,
};
use crate::generators::{extract_json, language_label, leading_chars, ONE_SHOT_CHAR_LIMIT};
use crate::ports::{DatabaseService, LanguageModelService, PortError, PortResult};
use crate::retry::RetryPolicy;

/// Highest grade of the Italian university scale.
pub const MAX_SCORE: u8 = 30;

const EXAMINER_INSTRUCTIONS: &str = r#"You are a demanding but fair university professor holding an oral exam on the
study material the student provides. Speak directly to the student, in {language}.
Ask one question at a time, each answerable from the material, moving from core
definitions to reasoning and connections between topics. Never repeat a question."#;

const FIRST_QUESTION_TASK: &str = r#"FIRST QUESTION: open the exam with one question.
Reply with only this JSON object: {"question": string}"#;

const EVALUATION_TASK: &str = r#"EVALUATE THE LAST ANSWER of the student against the material, in two or three
sentences, and grade it from 0 to 30. {next}
Reply with only this JSON object:
{"evaluation": string, "score": number, "next_question": string or null}"#;

const NEXT_QUESTION: &str = "Then ask the next question.";
const NO_NEXT_QUESTION: &str = "This was the last question: set next_question to null.";

const FINAL_TASK: &str = r#"FINAL EVALUATION: the exam is over. Judge the whole exam in a short paragraph and
give a final grade from 0 to 30.
Reply with only this JSON object: {"final_evaluation": string, "final_score": number}"#;

#[derive(Debug, thiserror::Error)]
pub enum OralExamError {
    #[error("oral exam is {}, expected {}", actual.as_str(), expected.as_str())]
    InvalidState {
        expected: OralExamStatus,
        actual: OralExamStatus,
    },
    #[error("oral exam or study session belongs to another account")]
    NotOwner,
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },
    #[error("no question is waiting for an answer")]
    NoOpenQuestion,
    #[error("the answer is empty")]
    EmptyAnswer,
    #[error("oral exam is at revision {actual}, the answer was for revision {expected}")]
    Stale { expected: i64, actual: i64 },
    #[error(transparent)]
    Port(#[from] PortError),
}

impl From<LedgerError> for OralExamError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => OralExamError::InsufficientCredits {
                required,
                available,
            },
            LedgerError::Port(e) => OralExamError::Port(e),
        }
    }
}

#[derive(Deserialize)]
struct FirstQuestion {
    question: String,
}

#[derive(Deserialize)]
struct Evaluation {
    evaluation: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    next_question: Option<String>,
}

#[derive(Deserialize)]
struct Verdict {
    final_evaluation: String,
    #[serde(default)]
    final_score: Option<f64>,
}

/// How a start was paid for, so it can be undone if the start is not persisted.
enum Charge {
    Free,
    Debited(Debit),
}

#[derive(Clone)]
pub struct OralExamService {
    db: Arc<dyn DatabaseService>,
    llm: Arc<dyn LanguageModelService>,
    ledger: CreditLedger,
    retry: RetryPolicy,
}

impl OralExamService {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        llm: Arc<dyn LanguageModelService>,
        ledger: CreditLedger,
    ) -> Self {
        Self {
            db,
            llm,
            ledger,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Creates an idle exam over one of the caller's study sessions.
    pub async fn open(
        &self,
        ctx: &AuthContext,
        study_session_id: Uuid,
        mode: OralExamMode,
    ) -> Result<OralExamSession, OralExamError> {
        let study = self.db.get_study_session(study_session_id).await?;
        if study.account_id != ctx.account_id {
            return Err(OralExamError::NotOwner);
        }
        let exam = OralExamSession::new(ctx.account_id, study_session_id, mode);
        self.db.create_oral_exam(&exam).await?;
        info!(
            "Opened {} oral exam {} on study session {}",
            mode.as_str(),
            exam.id,
            study_session_id
        );
        Ok(exam)
    }

    pub async fn get(
        &self,
        ctx: &AuthContext,
        exam_id: Uuid,
    ) -> Result<OralExamSession, OralExamError> {
        let exam = self.db.get_oral_exam(exam_id).await?;
        if exam.account_id != ctx.account_id {
            return Err(OralExamError::NotOwner);
        }
        Ok(exam)
    }

    /// Pays for the exam and asks the first question.
    ///
    /// A standard exam is free when this call is the one that claims the
    /// account's free exam; otherwise the mode's price is debited. If the
    /// started exam cannot be saved, the claim or the debit is given back.
    pub async fn start(
        &self,
        ctx: &AuthContext,
        exam_id: Uuid,
    ) -> Result<OralExamSession, OralExamError> {
        let mut exam = self.get(ctx, exam_id).await?;
        expect_status(&exam, OralExamStatus::Idle)?;
        let study = self.db.get_study_session(exam.study_session_id).await?;

        let charge = if exam.mode == OralExamMode::Standard
            && self.db.claim_free_oral_exam(ctx.account_id).await?
        {
            Charge::Free
        } else {
            Charge::Debited(
                self.ledger
                    .check_and_debit(ctx.account_id, exam.mode.operation())
                    .await?,
            )
        };

        let question = self.first_question(&study).await;
        exam.turns = vec![OralExamTurn::asking(question)];
        exam.status = OralExamStatus::Questioning;
        exam.free = matches!(charge, Charge::Free);

        if let Err(e) = self.persist(&mut exam).await {
            warn!("Oral exam {} start not persisted: {}. Undoing charge", exam.id, e);
            self.undo(ctx.account_id, charge).await;
            return Err(e.into());
        }
        info!(
            "Oral exam {} started ({})",
            exam.id,
            if exam.free { "free" } else { "charged" }
        );
        Ok(exam)
    }

    /// Records the answer to the open question, grades it and, unless the
    /// question budget is used up, asks the next one.
    ///
    /// With `seen_revision` set, the answer is refused unless the exam is still
    /// at that revision.
    pub async fn answer(
        &self,
        ctx: &AuthContext,
        exam_id: Uuid,
        answer: &str,
        seen_revision: Option<i64>,
    ) -> Result<OralExamSession, OralExamError> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(OralExamError::EmptyAnswer);
        }
        let mut exam = self.get(ctx, exam_id).await?;
        expect_status(&exam, OralExamStatus::Questioning)?;
        if let Some(expected) = seen_revision.filter(|r| *r != exam.revision) {
            return Err(OralExamError::Stale {
                expected,
                actual: exam.revision,
            });
        }
        exam.open_turn_mut()
            .ok_or(OralExamError::NoOpenQuestion)?
            .answer = Some(answer.to_string());

        let study = self.db.get_study_session(exam.study_session_id).await?;
        let more = exam.answered_count() < exam.mode.max_questions();
        let task = EVALUATION_TASK.replace("{next}", if more { NEXT_QUESTION } else { NO_NEXT_QUESTION });
        let italian = is_italian(&study.language);

        let evaluation = match self.ask::<Evaluation>(&study, &exam.turns, &task).await {
            Ok(evaluation) => evaluation,
            Err(reason) => {
                warn!("Evaluation for oral exam {} unavailable: {}", exam.id, reason);
                Evaluation {
                    evaluation: localized(
                        italian,
                        "Valutazione non disponibile per questa risposta.",
                        "No evaluation is available for this answer.",
                    )
                    .to_string(),
                    score: None,
                    next_question: None,
                }
            }
        };

        if let Some(turn) = exam.turns.last_mut() {
            turn.evaluation = Some(evaluation.evaluation.trim().to_string());
            turn.score = evaluation.score.map(grade);
        }
        if more {
            let next = evaluation
                .next_question
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| fallback_question(italian, exam.turns.len() + 1));
            exam.turns.push(OralExamTurn::asking(next));
        }
        self.persist(&mut exam).await?;
        Ok(exam)
    }

    /// Closes the exam with an overall evaluation and grade.
    pub async fn finish(
        &self,
        ctx: &AuthContext,
        exam_id: Uuid,
    ) -> Result<OralExamSession, OralExamError> {
        let mut exam = self.get(ctx, exam_id).await?;
        expect_status(&exam, OralExamStatus::Questioning)?;
        let study = self.db.get_study_session(exam.study_session_id).await?;

        let (evaluation, score) = match self.ask::<Verdict>(&study, &exam.turns, FINAL_TASK).await {
            Ok(verdict) => (
                verdict.final_evaluation.trim().to_string(),
                verdict.final_score.map(grade).or_else(|| average_score(&exam)),
            ),
            Err(reason) => {
                warn!("Final evaluation for oral exam {} unavailable: {}", exam.id, reason);
                (
                    localized(
                        is_italian(&study.language),
                        "Valutazione finale non disponibile; il voto e' la media delle risposte.",
                        "No final evaluation is available; the grade is the average of the answers.",
                    )
                    .to_string(),
                    average_score(&exam),
                )
            }
        };
        exam.final_evaluation = Some(evaluation);
        exam.final_score = score;
        exam.status = OralExamStatus::Completed;
        self.persist(&mut exam).await?;
        info!("Oral exam {} completed with score {:?}", exam.id, score);
        Ok(exam)
    }

    /// Clears the turns and returns the exam to `idle`. Starting it again is
    /// charged like any new start.
    pub async fn restart(
        &self,
        ctx: &AuthContext,
        exam_id: Uuid,
    ) -> Result<OralExamSession, OralExamError> {
        let mut exam = self.get(ctx, exam_id).await?;
        if exam.status == OralExamStatus::Idle {
            return Ok(exam);
        }
        exam.status = OralExamStatus::Idle;
        exam.turns.clear();
        exam.free = false;
        exam.final_evaluation = None;
        exam.final_score = None;
        self.persist(&mut exam).await?;
        Ok(exam)
    }

    /// Saves `exam` over the revision it was read at. Whoever saves second
    /// gets `Conflict`.
    async fn persist(&self, exam: &mut OralExamSession) -> PortResult<()> {
        let read_at = exam.revision;
        exam.revision += 1;
        exam.updated_at = Utc::now();
        self.db.save_oral_exam(exam, read_at).await
    }

    async fn first_question(&self, study: &StudySession) -> String {
        match self.ask::<FirstQuestion>(study, &[], FIRST_QUESTION_TASK).await {
            Ok(first) if !first.question.trim().is_empty() => first.question.trim().to_string(),
            Ok(_) => fallback_question(is_italian(&study.language), 1),
            Err(reason) => {
                warn!("First question unavailable: {}", reason);
                fallback_question(is_italian(&study.language), 1)
            }
        }
    }

    /// One examiner call, parsed as `T`. `Err` carries a loggable reason.
    async fn ask<T: serde::de::DeserializeOwned>(
        &self,
        study: &StudySession,
        turns: &[OralExamTurn],
        task: &str,
    ) -> Result<T, String> {
        let instructions = format!(
            "{}\n\n{}",
            EXAMINER_INSTRUCTIONS.replace("{language}", language_label(&study.language)),
            task
        );
        let input = transcript(study, turns);
        let raw = self
            .complete(&instructions, &input)
            .await
            .map_err(|e| e.to_string())?;
        let json = extract_json(&raw).ok_or_else(|| "no JSON object in reply".to_string())?;
        serde_json::from_str(json).map_err(|e| e.to_string())
    }

    async fn complete(&self, instructions: &str, input: &str) -> PortResult<String> {
        self.retry
            .run("oral exam model call", || self.llm.complete(instructions, input))
            .await
    }

    async fn undo(&self, account_id: Uuid, charge: Charge) {
        let undone = match charge {
            Charge::Free => self.db.release_free_oral_exam(account_id).await,
            Charge::Debited(debit) => self
                .ledger
                .refund(account_id, debit.kind, debit.amount)
                .await
                .map(|_| ()),
        };
        if let Err(e) = undone {
            warn!("Could not undo oral exam charge for {}: {}", account_id, e);
        }
    }
}

fn expect_status(exam: &OralExamSession, expected: OralExamStatus) -> Result<(), OralExamError> {
    if exam.status != expected {
        return Err(OralExamError::InvalidState {
            expected,
            actual: exam.status,
        });
    }
    Ok(())
}

fn transcript(study: &StudySession, turns: &[OralExamTurn]) -> String {
    let mut input = format!(
        "STUDY MATERIAL:\n---\n{}\n---\n",
        leading_chars(&study.document_text, ONE_SHOT_CHAR_LIMIT)
    );
    if !turns.is_empty() {
        input.push_str("\nEXAM SO FAR:\n");
        for (i, turn) in turns.iter().enumerate() {
            input.push_str(&format!("Q{}: {}\n", i + 1, turn.question));
            if let Some(answer) = &turn.answer {
                input.push_str(&format!("A{}: {}\n", i + 1, answer));
            }
            if let Some(score) = turn.score {
                input.push_str(&format!("Grade: {}/{}\n", score, MAX_SCORE));
            }
        }
    }
    input
}

fn grade(score: f64) -> u8 {
    score.round().clamp(0.0, MAX_SCORE as f64) as u8
}

fn average_score(exam: &OralExamSession) -> Option<u8> {
    let scores: Vec<u32> = exam
        .turns
        .iter()
        .filter_map(|turn| turn.score.map(u32::from))
        .collect();
    if scores.is_empty() {
        return None;
    }
    let total: u32 = scores.iter().sum();
    Some(((total + scores.len() as u32 / 2) / scores.len() as u32) as u8)
}

fn fallback_question(italian: bool, number: usize) -> String {
    if italian {
        format!(
            "Domanda {}: esponi con parole tue uno dei concetti principali del materiale.",
            number
        )
    } else {
        format!(
            "Question {}: explain in your own words one of the main concepts of the material.",
            number
        )
    }
}

fn localized<'s>(italian: bool, it: &'s str, en: &'s str) -> &'s str {
    if italian {
        it
    } else {
        en
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OperationKind;
    use crate::memory::InMemoryStore;
    use crate::testing::ScriptedModel;
    use std::time::Duration;

    fn professor() -> Arc<ScriptedModel> {
        slow_professor(Duration::ZERO)
    }

    fn slow_professor(delay: Duration) -> Arc<ScriptedModel> {
        ScriptedModel::slow(delay, |instructions, _| {
            let reply = if instructions.contains("FIRST QUESTION") {
                r#"{"question":"Che cos'e' l'entropia?"}"#
            } else if instructions.contains("EVALUATE THE LAST ANSWER") {
                r#"{"evaluation":"Risposta corretta ma incompleta.","score":27,"next_question":"Enuncia il secondo principio."}"#
            } else {
                r#"{"final_evaluation":"Buona preparazione.","final_score":28}"#
            };
            Ok(reply.to_string())
        })
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        service: OralExamService,
        ledger: CreditLedger,
        ctx: AuthContext,
        study_id: Uuid,
    }

    async fn fixture(balance: i64, model: Arc<ScriptedModel>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let account = store
            .create_account("orale@example.com", "hash", balance)
            .await
            .unwrap();
        let study = store
            .create_study_session(account.id, "Fisica", "it", "L'entropia misura il disordine.")
            .await
            .unwrap();
        let ledger = CreditLedger::new(store.clone());
        Fixture {
            service: OralExamService::new(store.clone(), model, ledger.clone())
                .with_retry(RetryPolicy::none()),
            ledger,
            ctx: AuthContext {
                account_id: account.id,
                email: account.email,
            },
            study_id: study.id,
            store,
        }
    }

    async fn started(f: &Fixture, mode: OralExamMode) -> Result<OralExamSession, OralExamError> {
        let exam = f.service.open(&f.ctx, f.study_id, mode).await?;
        f.service.start(&f.ctx, exam.id).await
    }

    #[tokio::test]
    async fn first_exam_is_free_and_the_second_is_charged() {
        let f = fixture(100, professor()).await;

        let first = started(&f, OralExamMode::Standard).await.unwrap();
        assert!(first.free);
        assert_eq!(first.status, OralExamStatus::Questioning);
        assert_eq!(first.turns[0].question, "Che cos'e' l'entropia?");
        assert_eq!(f.ledger.balance(f.ctx.account_id).await.unwrap(), 100);

        let second = started(&f, OralExamMode::Standard).await.unwrap();
        assert!(!second.free);
        assert_eq!(
            f.ledger.balance(f.ctx.account_id).await.unwrap(),
            100 - OperationKind::OralExam.cost()
        );
    }

    #[tokio::test]
    async fn ultra_exams_never_use_the_free_start() {
        let f = fixture(100, professor()).await;

        let ultra = started(&f, OralExamMode::Ultra).await.unwrap();
        assert!(!ultra.free);
        assert_eq!(f.ledger.balance(f.ctx.account_id).await.unwrap(), 50);

        let standard = started(&f, OralExamMode::Standard).await.unwrap();
        assert!(standard.free);
    }

    #[tokio::test]
    async fn a_start_that_is_not_saved_keeps_the_free_exam() {
        let f = fixture(100, professor()).await;
        let exam = f
            .service
            .open(&f.ctx, f.study_id, OralExamMode::Standard)
            .await
            .unwrap();

        f.store.set_oral_exam_writes_failing(true);
        let err = f.service.start(&f.ctx, exam.id).await.unwrap_err();
        assert!(matches!(err, OralExamError::Port(PortError::Unavailable(_))));
        let account = f.store.get_account(f.ctx.account_id).await.unwrap();
        assert!(!account.free_oral_exam_used);

        f.store.set_oral_exam_writes_failing(false);
        let retried = f.service.start(&f.ctx, exam.id).await.unwrap();
        assert!(retried.free);
        assert_eq!(f.ledger.balance(f.ctx.account_id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn a_charged_start_that_is_not_saved_is_refunded() {
        let f = fixture(100, professor()).await;
        let exam = f
            .service
            .open(&f.ctx, f.study_id, OralExamMode::Ultra)
            .await
            .unwrap();

        f.store.set_oral_exam_writes_failing(true);
        assert!(f.service.start(&f.ctx, exam.id).await.is_err());
        assert_eq!(f.ledger.balance(f.ctx.account_id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn a_full_exam_is_graded_and_closed() {
        let f = fixture(0, professor()).await;
        let exam = started(&f, OralExamMode::Standard).await.unwrap();

        let exam = f
            .service
            .answer(&f.ctx, exam.id, "Una misura del disordine.", None)
            .await
            .unwrap();
        assert_eq!(exam.turns.len(), 2);
        assert_eq!(exam.turns[0].score, Some(27));
        assert_eq!(exam.turns[1].question, "Enuncia il secondo principio.");

        let exam = f.service.finish(&f.ctx, exam.id).await.unwrap();
        assert_eq!(exam.status, OralExamStatus::Completed);
        assert_eq!(exam.final_score, Some(28));

        let late = f.service.answer(&f.ctx, exam.id, "ancora", None).await;
        assert!(matches!(
            late,
            Err(OralExamError::InvalidState {
                expected: OralExamStatus::Questioning,
                actual: OralExamStatus::Completed
            })
        ));

        let reset = f.service.restart(&f.ctx, exam.id).await.unwrap();
        assert_eq!(reset.status, OralExamStatus::Idle);
        assert!(reset.turns.is_empty());
    }

    #[tokio::test]
    async fn questions_stop_at_the_mode_limit() {
        let f = fixture(0, professor()).await;
        let mut exam = started(&f, OralExamMode::Standard).await.unwrap();
        for _ in 0..OralExamMode::Standard.max_questions() {
            exam = f.service.answer(&f.ctx, exam.id, "Risposta", None).await.unwrap();
        }
        assert_eq!(exam.turns.len(), OralExamMode::Standard.max_questions());
        assert!(exam.turns.iter().all(|t| t.answer.is_some()));

        let extra = f.service.answer(&f.ctx, exam.id, "Risposta", None).await;
        assert!(matches!(extra, Err(OralExamError::NoOpenQuestion)));
    }

    #[tokio::test]
    async fn starting_without_credits_leaves_the_exam_idle() {
        let f = fixture(10, professor()).await;
        let exam = f
            .service
            .open(&f.ctx, f.study_id, OralExamMode::Ultra)
            .await
            .unwrap();

        let err = f.service.start(&f.ctx, exam.id).await.unwrap_err();
        assert!(matches!(
            err,
            OralExamError::InsufficientCredits {
                required: 50,
                available: 10
            }
        ));
        let stored = f.service.get(&f.ctx, exam.id).await.unwrap();
        assert_eq!(stored.status, OralExamStatus::Idle);
    }

    #[tokio::test]
    async fn unusable_grading_falls_back_to_the_average() {
        let model = ScriptedModel::new(|instructions, _| {
            if instructions.contains("FIRST QUESTION") {
                Ok(r#"{"question":"Domanda?"}"#.into())
            } else if instructions.contains("EVALUATE THE LAST ANSWER") {
                Ok(r#"{"evaluation":"Ok","score":24.6,"next_question":null}"#.into())
            } else {
                Err(PortError::Unavailable("overloaded".into()))
            }
        });
        let f = fixture(0, model).await;
        let exam = started(&f, OralExamMode::Standard).await.unwrap();

        let exam = f.service.answer(&f.ctx, exam.id, "Risposta", None).await.unwrap();
        assert_eq!(exam.turns[0].score, Some(25));
        assert!(exam.turns[1].question.starts_with("Domanda 2"));

        let exam = f.service.finish(&f.ctx, exam.id).await.unwrap();
        assert_eq!(exam.final_score, Some(25));
        assert!(exam.final_evaluation.is_some());
    }

    #[tokio::test]
    async fn empty_answers_and_strangers_are_refused() {
        let f = fixture(0, professor()).await;
        let exam = started(&f, OralExamMode::Standard).await.unwrap();

        assert!(matches!(
            f.service.answer(&f.ctx, exam.id, "   ", None).await,
            Err(OralExamError::EmptyAnswer)
        ));
        let stranger = AuthContext {
            account_id: Uuid::new_v4(),
            email: "x@example.com".into(),
        };
        assert!(matches!(
            f.service.get(&stranger, exam.id).await,
            Err(OralExamError::NotOwner)
        ));
    }

    #[tokio::test]
    async fn concurrent_answers_record_only_one() {
        let f = fixture(0, slow_professor(Duration::from_millis(50))).await;
        let exam = started(&f, OralExamMode::Standard).await.unwrap();

        let (a, b) = tokio::join!(
            f.service.answer(&f.ctx, exam.id, "answer A", None),
            f.service.answer(&f.ctx, exam.id, "answer B", None),
        );
        let (won, lost) = match (a, b) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            other => panic!("expected exactly one answer to be recorded, got {other:?}"),
        };
        assert!(matches!(lost, OralExamError::Port(PortError::Conflict(_))));

        let stored = f.service.get(&f.ctx, exam.id).await.unwrap();
        assert_eq!(stored.answered_count(), 1);
        assert_eq!(stored.turns[0].answer, won.turns[0].answer);
        assert_eq!(stored.revision, won.revision);
    }

    #[tokio::test]
    async fn a_replayed_answer_does_not_land_on_the_next_question() {
        let f = fixture(0, professor()).await;
        let exam = started(&f, OralExamMode::Standard).await.unwrap();
        let seen = exam.revision;

        let answered = f
            .service
            .answer(&f.ctx, exam.id, "Una misura del disordine.", Some(seen))
            .await
            .unwrap();

        let replay = f
            .service
            .answer(&f.ctx, exam.id, "Una misura del disordine.", Some(seen))
            .await;
        assert!(matches!(
            replay,
            Err(OralExamError::Stale { expected, actual }) if expected == seen && actual == answered.revision
        ));
        let stored = f.service.get(&f.ctx, exam.id).await.unwrap();
        assert_eq!(stored.answered_count(), 1);
        assert!(stored.turns[1].answer.is_none());
    }
}
