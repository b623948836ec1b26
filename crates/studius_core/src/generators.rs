//! The Artifact Generators.
//!
//! Each generator turns (text, target language) into one structured artifact
//! through a single model call. The model's reply must parse as strict JSON;
//! a reply that does not is reprompted once with a stricter instruction, and
//! if that fails too the caller gets a clearly marked placeholder. Callers that
//! have already debited credits therefore always receive an artifact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ascii::{is_italian, to_ascii_words};
use crate::domain::{
    ArtifactKind, ArtifactPatch, ConceptMap, ConceptNode, ExamGuide, ExamPhase, FlashcardSet,
    NodeKind, Quiz, StudySession, SummaryArtifact,
};
use crate::ports::{LanguageModelService, PortError, PortResult};
use crate::retry::RetryPolicy;

/// Single-request generators only read this many leading characters.
pub const ONE_SHOT_CHAR_LIMIT: usize = 60_000;
pub const FLASHCARD_COUNT: usize = 10;
pub const QUIZ_QUESTION_COUNT: usize = 10;
pub const QUIZ_OPTION_COUNT: usize = 4;
pub const CONCEPT_MAP_MAX_DEPTH: usize = 3;
pub const CONCEPT_MAP_MAX_CHILDREN: usize = 6;
pub const EXAM_GUIDE_PHASES: usize = 4;
pub const EXAM_GUIDE_MINUTES: u32 = 60;

/// Characters per printed page when estimating document length.
const CHARS_PER_PAGE: usize = 1_800;

const SUMMARY_TASK: &str = r#"Write a clear, concise summary (about 300 words) of the study material below.
Keep the key definitions, results and relationships a student needs for an exam."#;

const EXTENDED_SUMMARY_TASK: &str = r#"Write a detailed, well structured summary of the study material below,
of about {words} words. Use short paragraphs, keep every definition, formula and
example that matters, and follow the order of the original material."#;

const FLASHCARDS_TASK: &str = r#"Create exactly {count} flashcards from the study material below.
The front asks one precise question, the back answers it in one or two sentences.

Use plain ASCII text only. Never write mathematical or special symbols: spell them
out in words of the target language (for example "x ∈ A" must be written as
"x appartiene ad A" in Italian or "x belongs to A" in English, "x²" as "x squared")."#;

const QUIZ_TASK: &str = r#"Create exactly {count} multiple-choice questions from the study material below.
Every question has exactly 4 options, one correct option identified by its 0-based
"correct_index", and an "explanation" of why that option is correct."#;

const CONCEPT_MAP_TASK: &str = r#"Build a concept map of the study material below as a tree.
The root is the main topic. Use at most {depth} levels below the root and at most
{children} children per node. Tag each node with a "type" among concept, definition,
formula, example, process, law, theory and a "priority" among high, medium, low."#;

const EXAM_GUIDE_TASK: &str = r#"The student has an exam in one hour. Write a study plan of exactly {phases}
phases covering the material below. Each phase has a short "title", a
"duration_minutes" and a "description" of what to do; durations add up to 60."#;

const SUMMARY_SCHEMA: &str = r#"{"title": string, "content": string}"#;
const FLASHCARDS_SCHEMA: &str = r#"{"flashcards": [{"front": string, "back": string}]}"#;
const QUIZ_SCHEMA: &str = r#"{"questions": [{"question": string, "options": [string, string, string, string], "correct_index": number, "explanation": string}]}"#;
const CONCEPT_MAP_SCHEMA: &str = r#"{"root": {"title": string, "description": string, "type": string, "priority": string, "children": [ ...same shape... ]}}"#;
const EXAM_GUIDE_SCHEMA: &str = r#"{"phases": [{"title": string, "duration_minutes": number, "description": string}]}"#;

const OUTPUT_RULES: &str = r#"Write every text field in {language}.
Reply with a single JSON object matching this schema and nothing else:
{schema}"#;

const STRICT_JSON_REMINDER: &str = r#"IMPORTANT: your previous reply could not be used ({reason}).
Reply with ONLY the JSON object: no markdown fences, no comments, no text before
or after it, double-quoted keys and strings, no trailing commas."#;

const TUTOR_INSTRUCTIONS: &str = r#"You are a patient university tutor. Answer the student's question using the
study material they provide. If the material does not cover the question, say so
briefly and answer from general knowledge. Answer in {language}, in a few
sentences, without markdown."#;

const TUTOR_INPUT_TEMPLATE: &str = r#"STUDY MATERIAL:
---
{document}
---

QUESTION:
{question}"#;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("language model call failed: {0}")]
    Model(#[from] PortError),
    #[error("model output could not be used: {0}")]
    Malformed(String),
}

/// Everything a generator needs to know about one call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub kind: ArtifactKind,
    pub text: &'a str,
    pub language: &'a str,
    /// `(index, total)`, 1-based, when the text is one section of a longer document.
    pub section: Option<(u32, u32)>,
    /// Length of the whole document, used to size extended summaries.
    pub document_chars: usize,
}

impl<'a> GenerationRequest<'a> {
    /// A one-shot request over the leading `ONE_SHOT_CHAR_LIMIT` characters.
    pub fn for_document(kind: ArtifactKind, session: &'a StudySession) -> Self {
        Self {
            kind,
            text: leading_chars(&session.document_text, ONE_SHOT_CHAR_LIMIT),
            language: &session.language,
            section: None,
            document_chars: session.document_chars(),
        }
    }

    pub fn for_section(
        kind: ArtifactKind,
        text: &'a str,
        language: &'a str,
        index: u32,
        total: u32,
    ) -> Self {
        Self {
            kind,
            text,
            language,
            section: Some((index, total)),
            document_chars: text.chars().count(),
        }
    }

    fn italian(&self) -> bool {
        is_italian(self.language)
    }
}

/// A structured artifact the model can produce.
pub trait Artifact: Serialize + DeserializeOwned + Send + Sized {
    const SCHEMA: &'static str;

    /// Validates and cleans a parsed reply. `Err` carries the reason it was rejected.
    fn normalize(self, req: &GenerationRequest<'_>) -> Result<Self, String>;

    /// The marked stand-in used when no usable reply was obtained.
    fn placeholder(req: &GenerationRequest<'_>) -> Self;
}

impl Artifact for SummaryArtifact {
    const SCHEMA: &'static str = SUMMARY_SCHEMA;

    fn normalize(mut self, req: &GenerationRequest<'_>) -> Result<Self, String> {
        self.content = self.content.trim().to_string();
        if self.content.is_empty() {
            return Err("summary content is empty".into());
        }
        self.title = self.title.trim().to_string();
        if self.title.is_empty() {
            self.title = localized(req, "Riassunto", "Summary").to_string();
        }
        self.placeholder = false;
        Ok(self)
    }

    fn placeholder(req: &GenerationRequest<'_>) -> Self {
        let content = match req.section {
            Some((index, _)) => format!(
                "{} {}: {}",
                localized(req, "Sezione", "Section"),
                index,
                localized(
                    req,
                    "il contenuto di questa sezione non e' stato generato.",
                    "the content of this section could not be generated.",
                )
            ),
            None => localized(
                req,
                "Non e' stato possibile generare il riassunto. Riprova piu' tardi.",
                "The summary could not be generated. Please try again later.",
            )
            .to_string(),
        };
        SummaryArtifact {
            title: localized(req, "Riassunto non disponibile", "Summary unavailable").to_string(),
            content,
            placeholder: true,
        }
    }
}

impl Artifact for FlashcardSet {
    const SCHEMA: &'static str = FLASHCARDS_SCHEMA;

    fn normalize(mut self, req: &GenerationRequest<'_>) -> Result<Self, String> {
        self.flashcards.retain(|card| {
            !card.front.trim().is_empty() && !card.back.trim().is_empty()
        });
        if self.flashcards.len() < FLASHCARD_COUNT {
            return Err(format!(
                "{} usable flashcards instead of {}",
                self.flashcards.len(),
                FLASHCARD_COUNT
            ));
        }
        self.flashcards.truncate(FLASHCARD_COUNT);
        for card in &mut self.flashcards {
            card.front = to_ascii_words(&card.front, req.language);
            card.back = to_ascii_words(&card.back, req.language);
        }
        self.placeholder = false;
        Ok(self)
    }

    fn placeholder(req: &GenerationRequest<'_>) -> Self {
        FlashcardSet {
            flashcards: vec![crate::domain::Flashcard {
                front: localized(req, "Flashcard non disponibili", "Flashcards unavailable")
                    .to_string(),
                back: localized(
                    req,
                    "Non e' stato possibile generare le flashcard. Riprova piu' tardi.",
                    "The flashcards could not be generated. Please try again later.",
                )
                .to_string(),
            }],
            placeholder: true,
        }
    }
}

impl Artifact for Quiz {
    const SCHEMA: &'static str = QUIZ_SCHEMA;

    fn normalize(mut self, _req: &GenerationRequest<'_>) -> Result<Self, String> {
        for (i, q) in self.questions.iter().enumerate() {
            if q.question.trim().is_empty() {
                return Err(format!("question {} is empty", i + 1));
            }
            if q.options.len() != QUIZ_OPTION_COUNT {
                return Err(format!(
                    "question {} has {} options instead of {}",
                    i + 1,
                    q.options.len(),
                    QUIZ_OPTION_COUNT
                ));
            }
            if q.correct_index >= QUIZ_OPTION_COUNT {
                return Err(format!("question {} has no valid correct option", i + 1));
            }
            if q.explanation.trim().is_empty() {
                return Err(format!("question {} has no explanation", i + 1));
            }
        }
        if self.questions.len() < QUIZ_QUESTION_COUNT {
            return Err(format!(
                "{} questions instead of {}",
                self.questions.len(),
                QUIZ_QUESTION_COUNT
            ));
        }
        self.questions.truncate(QUIZ_QUESTION_COUNT);
        self.placeholder = false;
        Ok(self)
    }

    fn placeholder(_req: &GenerationRequest<'_>) -> Self {
        Quiz {
            questions: Vec::new(),
            placeholder: true,
        }
    }
}

impl Artifact for ConceptMap {
    const SCHEMA: &'static str = CONCEPT_MAP_SCHEMA;

    fn normalize(mut self, _req: &GenerationRequest<'_>) -> Result<Self, String> {
        if self.root.title.trim().is_empty() {
            return Err("concept map root has no title".into());
        }
        prune(&mut self.root, 0);
        self.placeholder = false;
        Ok(self)
    }

    fn placeholder(req: &GenerationRequest<'_>) -> Self {
        let mut root = ConceptNode::new(
            localized(req, "Mappa concettuale non disponibile", "Concept map unavailable"),
            NodeKind::Concept,
        );
        if let Some((index, _)) = req.section {
            root.title = format!("{} {}", localized(req, "Sezione", "Section"), index);
            root.description = Some(
                localized(req, "Contenuto non generato", "Content not generated").to_string(),
            );
        }
        ConceptMap {
            root,
            placeholder: true,
        }
    }
}

/// Drops titleless nodes and trims the tree to the allowed depth and fan-out.
fn prune(node: &mut ConceptNode, depth: usize) {
    node.title = node.title.trim().to_string();
    if depth >= CONCEPT_MAP_MAX_DEPTH {
        node.children.clear();
        return;
    }
    node.children.retain(|child| !child.title.trim().is_empty());
    node.children.truncate(CONCEPT_MAP_MAX_CHILDREN);
    for child in &mut node.children {
        prune(child, depth + 1);
    }
}

impl Artifact for ExamGuide {
    const SCHEMA: &'static str = EXAM_GUIDE_SCHEMA;

    fn normalize(mut self, _req: &GenerationRequest<'_>) -> Result<Self, String> {
        if self.phases.len() != EXAM_GUIDE_PHASES {
            return Err(format!(
                "exam guide has {} phases instead of {}",
                self.phases.len(),
                EXAM_GUIDE_PHASES
            ));
        }
        if self.phases.iter().any(|p| p.title.trim().is_empty()) {
            return Err("exam guide phase without a title".into());
        }
        fit_to_the_hour(&mut self.phases);
        self.placeholder = false;
        Ok(self)
    }

    fn placeholder(req: &GenerationRequest<'_>) -> Self {
        let phases = [
            ("Lettura rapida", "Skim the material", "Scorri il testo e segna titoli e definizioni.", "Skim the text and mark headings and definitions."),
            ("Concetti chiave", "Key concepts", "Riscrivi a parole tue i concetti principali.", "Rewrite the main concepts in your own words."),
            ("Esercizio attivo", "Active practice", "Ripeti ad alta voce e svolgi un esempio per argomento.", "Recite aloud and work one example per topic."),
            ("Ripasso finale", "Final review", "Rileggi i punti segnati e verifica cosa ricordi.", "Reread the marked points and test what you remember."),
        ];
        ExamGuide {
            phases: phases
                .iter()
                .map(|(it_title, en_title, it_desc, en_desc)| ExamPhase {
                    title: localized(req, it_title, en_title).to_string(),
                    duration_minutes: EXAM_GUIDE_MINUTES / EXAM_GUIDE_PHASES as u32,
                    description: localized(req, it_desc, en_desc).to_string(),
                })
                .collect(),
            placeholder: true,
        }
    }
}

/// Rescales phase durations so they add up to exactly one hour.
fn fit_to_the_hour(phases: &mut [ExamPhase]) {
    let equal_share = EXAM_GUIDE_MINUTES / phases.len().max(1) as u32;
    let total: u32 = phases.iter().map(|p| p.duration_minutes).sum();
    if total == EXAM_GUIDE_MINUTES {
        return;
    }
    if total == 0 {
        phases.iter_mut().for_each(|p| p.duration_minutes = equal_share);
        return;
    }

    let last = phases.len() - 1;
    let mut assigned = 0;
    for phase in &mut phases[..last] {
        let scaled = (phase.duration_minutes * EXAM_GUIDE_MINUTES + total / 2) / total;
        phase.duration_minutes = scaled.max(1);
        assigned += phase.duration_minutes;
    }
    if assigned >= EXAM_GUIDE_MINUTES {
        phases.iter_mut().for_each(|p| p.duration_minutes = equal_share);
    } else {
        phases[last].duration_minutes = EXAM_GUIDE_MINUTES - assigned;
    }
}

/// A tutor reply. `placeholder` is set when the model could not be reached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TutorAnswer {
    pub answer: String,
    pub placeholder: bool,
}

/// Runs the generators against a `LanguageModelService`.
#[derive(Clone)]
pub struct ArtifactGenerator {
    llm: Arc<dyn LanguageModelService>,
    retry: RetryPolicy,
}

impl ArtifactGenerator {
    pub fn new(llm: Arc<dyn LanguageModelService>) -> Self {
        Self {
            llm,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// One model call, reprompted once if the reply cannot be used.
    pub async fn try_generate<A: Artifact>(
        &self,
        req: &GenerationRequest<'_>,
    ) -> Result<A, GenerationError> {
        let instructions = instructions_for::<A>(req);
        let raw = self.complete(&instructions, req.text).await?;
        let reason = match parse_artifact::<A>(&raw, req) {
            Ok(artifact) => return Ok(artifact),
            Err(reason) => reason,
        };

        warn!(
            "Unusable {} reply ({}); reprompting with strict JSON instructions",
            req.kind.slug(),
            reason
        );
        debug!("Rejected reply: {}", raw);
        let strict = format!(
            "{}\n\n{}",
            instructions,
            STRICT_JSON_REMINDER.replace("{reason}", &reason)
        );
        let raw = self.complete(&strict, req.text).await?;
        parse_artifact::<A>(&raw, req).map_err(GenerationError::Malformed)
    }

    /// Like `try_generate`, but never fails: errors yield `A::placeholder`.
    pub async fn generate<A: Artifact>(&self, req: &GenerationRequest<'_>) -> A {
        match self.try_generate(req).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(
                    "Falling back to a placeholder {}: {}",
                    req.kind.slug(),
                    e
                );
                A::placeholder(req)
            }
        }
    }

    /// Generates one artifact of `kind` for the whole session document.
    pub async fn generate_patch(&self, kind: ArtifactKind, session: &StudySession) -> ArtifactPatch {
        let req = GenerationRequest::for_document(kind, session);
        match kind {
            ArtifactKind::Summary => ArtifactPatch::Summary(self.generate(&req).await),
            ArtifactKind::ExtendedSummary => {
                ArtifactPatch::ExtendedSummary(self.generate(&req).await)
            }
            ArtifactKind::Flashcards => ArtifactPatch::Flashcards(self.generate(&req).await),
            ArtifactKind::Quiz => ArtifactPatch::Quiz(self.generate(&req).await),
            ArtifactKind::ConceptMap => ArtifactPatch::ConceptMap(self.generate(&req).await),
            ArtifactKind::ExamGuide => ArtifactPatch::ExamGuide(self.generate(&req).await),
        }
    }

    /// Answers a free-form question grounded in the session document.
    pub async fn answer_question(&self, session: &StudySession, question: &str) -> TutorAnswer {
        let instructions =
            TUTOR_INSTRUCTIONS.replace("{language}", language_label(&session.language));
        let input = TUTOR_INPUT_TEMPLATE
            .replace(
                "{document}",
                leading_chars(&session.document_text, ONE_SHOT_CHAR_LIMIT),
            )
            .replace("{question}", question.trim());

        match self.complete(&instructions, &input).await {
            Ok(answer) if !answer.trim().is_empty() => TutorAnswer {
                answer: answer.trim().to_string(),
                placeholder: false,
            },
            Ok(_) => self.tutor_placeholder(&session.language, "empty reply"),
            Err(e) => self.tutor_placeholder(&session.language, &e.to_string()),
        }
    }

    fn tutor_placeholder(&self, language: &str, reason: &str) -> TutorAnswer {
        warn!("Tutor answer unavailable: {}", reason);
        let answer = if is_italian(language) {
            "Al momento non riesco a rispondere. Riprova tra poco."
        } else {
            "I can't answer right now. Please try again shortly."
        };
        TutorAnswer {
            answer: answer.to_string(),
            placeholder: true,
        }
    }

    async fn complete(&self, instructions: &str, input: &str) -> PortResult<String> {
        self.retry
            .run("language model call", || self.llm.complete(instructions, input))
            .await
    }
}

fn instructions_for<A: Artifact>(req: &GenerationRequest<'_>) -> String {
    let task = match req.kind {
        ArtifactKind::Summary => SUMMARY_TASK.to_string(),
        ArtifactKind::ExtendedSummary => EXTENDED_SUMMARY_TASK.replace(
            "{words}",
            &extended_summary_words(req.document_chars).to_string(),
        ),
        ArtifactKind::Flashcards => {
            FLASHCARDS_TASK.replace("{count}", &FLASHCARD_COUNT.to_string())
        }
        ArtifactKind::Quiz => QUIZ_TASK.replace("{count}", &QUIZ_QUESTION_COUNT.to_string()),
        ArtifactKind::ConceptMap => CONCEPT_MAP_TASK
            .replace("{depth}", &CONCEPT_MAP_MAX_DEPTH.to_string())
            .replace("{children}", &CONCEPT_MAP_MAX_CHILDREN.to_string()),
        ArtifactKind::ExamGuide => {
            EXAM_GUIDE_TASK.replace("{phases}", &EXAM_GUIDE_PHASES.to_string())
        }
    };
    let scope = match req.section {
        Some((index, total)) => format!(
            "\n\nThe material is section {} of {} of a longer document. Cover only this section.",
            index, total
        ),
        None => String::new(),
    };
    let rules = OUTPUT_RULES
        .replace("{language}", language_label(req.language))
        .replace("{schema}", A::SCHEMA);
    format!("{}{}\n\n{}", task, scope, rules)
}

fn parse_artifact<A: Artifact>(raw: &str, req: &GenerationRequest<'_>) -> Result<A, String> {
    let json = extract_json(raw).ok_or_else(|| "no JSON object in reply".to_string())?;
    let artifact: A = serde_json::from_str(json).map_err(|e| e.to_string())?;
    artifact.normalize(req)
}

/// Finds the JSON object in a reply: a fenced block if present, otherwise the
/// span from the first `{` to the last `}`.
pub fn extract_json(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if let Some(start) = raw.find("```") {
        let body = &raw[start + 3..];
        let body = body.strip_prefix("json").unwrap_or(body);
        if let Some(end) = body.find("```") {
            return extract_json(&body[..end]);
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

/// Target length of an extended summary, in discrete tiers of estimated pages.
pub fn extended_summary_words(document_chars: usize) -> u32 {
    let pages = document_chars.div_ceil(CHARS_PER_PAGE);
    match pages {
        0..=5 => 500,
        6..=20 => 1_000,
        21..=50 => 2_000,
        _ => 3_000,
    }
}

pub fn language_label(language: &str) -> &str {
    if is_italian(language) {
        return "Italian";
    }
    match language.trim().to_ascii_lowercase().as_str() {
        "en" | "en-us" | "en-gb" | "english" => "English",
        "es" | "spanish" => "Spanish",
        "fr" | "french" => "French",
        "de" | "german" => "German",
        _ => language,
    }
}

fn localized<'s>(req: &GenerationRequest<'_>, italian: &'s str, english: &'s str) -> &'s str {
    if req.italian() {
        italian
    } else {
        english
    }
}

pub(crate) fn leading_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Artifacts;
    use crate::testing::ScriptedModel;
    use chrono::Utc;
    use uuid::Uuid;

    fn session(text: &str, language: &str) -> StudySession {
        StudySession {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            title: "Insiemi".into(),
            language: language.into(),
            document_text: text.into(),
            artifacts: Artifacts::default(),
            created_at: Utc::now(),
        }
    }

    fn generator(model: Arc<ScriptedModel>) -> ArtifactGenerator {
        ArtifactGenerator::new(model).with_retry(RetryPolicy::none())
    }

    fn quiz_reply(questions: usize) -> String {
        let questions: Vec<_> = (1..=questions)
            .map(|n| {
                serde_json::json!({
                    "question": format!("Quanto fa {n}+2?"),
                    "options": ["1", "2", "3", (n + 2).to_string()],
                    "correct_index": 3,
                    "explanation": "Somma elementare.",
                })
            })
            .collect();
        serde_json::json!({ "questions": questions }).to_string()
    }

    fn flashcards_reply(cards: usize) -> String {
        let mut flashcards = vec![serde_json::json!({"front": "Cosa significa x ∈ A?", "back": "x ∈ A"})];
        flashcards.extend((2..=cards).map(|n| {
            serde_json::json!({"front": format!("Domanda {n}"), "back": format!("Risposta {n}")})
        }));
        serde_json::json!({ "flashcards": flashcards }).to_string()
    }

    #[tokio::test]
    async fn flashcards_spell_out_symbols() {
        let model = ScriptedModel::replies(vec![Ok(flashcards_reply(FLASHCARD_COUNT))]);
        let doc = session("x ∈ A indica l'appartenenza.", "it");

        let patch = generator(model)
            .generate_patch(ArtifactKind::Flashcards, &doc)
            .await;
        let ArtifactPatch::Flashcards(set) = patch else {
            panic!("unexpected patch kind");
        };
        assert!(!set.placeholder);
        assert_eq!(set.flashcards[0].back, "x appartiene ad A");
        let json = serde_json::to_string(&set).unwrap();
        assert!(json.is_ascii(), "{json}");
    }

    #[tokio::test]
    async fn malformed_reply_is_reprompted_once() {
        let model = ScriptedModel::replies(vec![
            Ok("Ecco il quiz che hai chiesto!".into()),
            Ok(quiz_reply(QUIZ_QUESTION_COUNT)),
        ]);
        let doc = session("Aritmetica di base.", "it");

        let quiz: Quiz = generator(model.clone())
            .try_generate(&GenerationRequest::for_document(ArtifactKind::Quiz, &doc))
            .await
            .unwrap();
        assert_eq!(quiz.questions.len(), QUIZ_QUESTION_COUNT);

        let calls = model.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].0.contains("IMPORTANT: your previous reply"));
        assert!(calls[1].0.contains("IMPORTANT: your previous reply"));
    }

    #[tokio::test]
    async fn quiz_with_three_options_is_rejected() {
        let bad = r#"{"questions":[{"question":"Q?","options":["a","b","c"],"correct_index":0,"explanation":"e"}]}"#;
        let model = ScriptedModel::replies(vec![Ok(bad.into()), Ok(bad.into())]);
        let doc = session("Testo.", "en");
        let req = GenerationRequest::for_document(ArtifactKind::Quiz, &doc);

        let err = generator(model.clone())
            .try_generate::<Quiz>(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Malformed(ref m) if m.contains("3 options")));

        let quiz: Quiz = generator(ScriptedModel::replies(vec![Ok(bad.into()), Ok(bad.into())]))
            .generate(&req)
            .await;
        assert!(quiz.placeholder);
        assert!(quiz.questions.is_empty());
    }

    #[tokio::test]
    async fn short_sets_are_reprompted_then_replaced() {
        let model = ScriptedModel::replies(vec![
            Ok(flashcards_reply(3)),
            Ok(flashcards_reply(FLASHCARD_COUNT + 2)),
        ]);
        let doc = session("Teoria degli insiemi.", "it");
        let req = GenerationRequest::for_document(ArtifactKind::Flashcards, &doc);

        let set: FlashcardSet = generator(model.clone()).try_generate(&req).await.unwrap();
        assert_eq!(set.flashcards.len(), FLASHCARD_COUNT);
        assert!(model.calls().await[1].0.contains("IMPORTANT: your previous reply"));

        let short = quiz_reply(QUIZ_QUESTION_COUNT - 1);
        let quiz: Quiz = generator(ScriptedModel::replies(vec![Ok(short.clone()), Ok(short)]))
            .generate(&GenerationRequest::for_document(ArtifactKind::Quiz, &doc))
            .await;
        assert!(quiz.placeholder);
        assert!(quiz.questions.is_empty());
    }

    #[tokio::test]
    async fn model_outage_yields_a_placeholder() {
        let model = ScriptedModel::replies(vec![Err(PortError::Unavailable("timeout".into()))]);
        let doc = session("Testo.", "it");

        let patch = generator(model).generate_patch(ArtifactKind::Summary, &doc).await;
        let ArtifactPatch::Summary(summary) = patch else {
            panic!("unexpected patch kind");
        };
        assert!(summary.placeholder);
        assert_eq!(summary.title, "Riassunto non disponibile");
    }

    #[tokio::test]
    async fn fenced_json_is_accepted() {
        let model = ScriptedModel::replies(vec![Ok(
            "Certo!\n```json\n{\"title\":\"Insiemi\",\"content\":\"Un insieme e' una collezione.\"}\n```".into(),
        )]);
        let doc = session("Teoria degli insiemi.", "it");

        let summary: SummaryArtifact = generator(model)
            .try_generate(&GenerationRequest::for_document(ArtifactKind::Summary, &doc))
            .await
            .unwrap();
        assert_eq!(summary.title, "Insiemi");
        assert!(!summary.placeholder);
    }

    #[tokio::test]
    async fn one_shot_generators_read_a_bounded_prefix() {
        let model = ScriptedModel::replies(vec![Ok(quiz_reply(QUIZ_QUESTION_COUNT))]);
        let doc = session(&"a".repeat(ONE_SHOT_CHAR_LIMIT + 10_000), "en");

        generator(model.clone())
            .generate_patch(ArtifactKind::Quiz, &doc)
            .await;
        let calls = model.calls().await;
        assert_eq!(calls[0].1.len(), ONE_SHOT_CHAR_LIMIT);
    }

    #[tokio::test]
    async fn exam_guide_is_rescaled_to_one_hour() {
        let reply = r#"{"phases":[
            {"title":"Lettura","duration_minutes":20,"description":"a"},
            {"title":"Schemi","duration_minutes":20,"description":"b"},
            {"title":"Esercizi","duration_minutes":30,"description":"c"},
            {"title":"Ripasso","duration_minutes":10,"description":"d"}]}"#;
        let model = ScriptedModel::replies(vec![Ok(reply.into())]);
        let doc = session("Testo.", "it");

        let guide: ExamGuide = generator(model)
            .try_generate(&GenerationRequest::for_document(ArtifactKind::ExamGuide, &doc))
            .await
            .unwrap();
        let total: u32 = guide.phases.iter().map(|p| p.duration_minutes).sum();
        assert_eq!(total, EXAM_GUIDE_MINUTES);
        assert_eq!(guide.phases[0].duration_minutes, 15);
    }

    #[test]
    fn concept_maps_are_pruned_to_the_allowed_shape() {
        let mut root = ConceptNode::new("Fisica", NodeKind::Concept);
        let mut level = &mut root;
        for depth in 0..5 {
            level.children = (0..9)
                .map(|i| ConceptNode::new(format!("n{depth}-{i}"), NodeKind::Definition))
                .collect();
            level = &mut level.children[0];
        }
        let doc = session("Testo.", "it");
        let req = GenerationRequest::for_document(ArtifactKind::ConceptMap, &doc);

        let map = ConceptMap {
            root,
            placeholder: true,
        }
        .normalize(&req)
        .unwrap();

        fn depth(node: &ConceptNode) -> usize {
            node.children.iter().map(|c| 1 + depth(c)).max().unwrap_or(0)
        }
        assert_eq!(depth(&map.root), CONCEPT_MAP_MAX_DEPTH);
        assert_eq!(map.root.children.len(), CONCEPT_MAP_MAX_CHILDREN);
        assert!(!map.placeholder);
    }

    #[test]
    fn extended_summary_length_follows_page_tiers() {
        assert_eq!(extended_summary_words(5 * 1_800), 500);
        assert_eq!(extended_summary_words(5 * 1_800 + 1), 1_000);
        assert_eq!(extended_summary_words(20 * 1_800), 1_000);
        assert_eq!(extended_summary_words(50 * 1_800), 2_000);
        assert_eq!(extended_summary_words(400_000), 3_000);
    }

    #[test]
    fn json_is_found_inside_chatter() {
        assert_eq!(extract_json("sure: {\"a\":1} bye"), Some("{\"a\":1}"));
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("nothing here"), None);
    }

    #[tokio::test]
    async fn tutor_answers_from_the_document() {
        let model = ScriptedModel::new(|instructions, input| {
            assert!(instructions.contains("Italian"));
            assert!(input.contains("QUESTION:\nChe cos'e' un insieme?"));
            Ok("  Una collezione di oggetti.  ".into())
        });
        let doc = session("Un insieme e' una collezione di oggetti.", "it");

        let answer = generator(model)
            .answer_question(&doc, "Che cos'e' un insieme?")
            .await;
        assert_eq!(answer.answer, "Una collezione di oggetti.");
        assert!(!answer.placeholder);
    }
}
