//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use std::sync::Arc;
use studius_core::ports::{DatabaseService, LanguageModelService, SpeechToTextService};
use studius_core::{ArtifactGenerator, CreditLedger, OralExamService, StudyService, UltraRunner};

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub config: Arc<Config>,
    pub ledger: CreditLedger,
    pub study: StudyService,
    pub ultra: UltraRunner,
    pub oral_exams: OralExamService,
    pub stt: Arc<dyn SpeechToTextService>,
}

impl AppState {
    /// Wires the core services over the given adapters.
    ///
    /// `study_llm` drives artifacts, the tutor and Ultra jobs; `exam_llm`
    /// drives oral exams.
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn DatabaseService>,
        study_llm: Arc<dyn LanguageModelService>,
        exam_llm: Arc<dyn LanguageModelService>,
        stt: Arc<dyn SpeechToTextService>,
    ) -> Self {
        let ledger = CreditLedger::new(db.clone());
        let generator = ArtifactGenerator::new(study_llm);
        let study = StudyService::new(db.clone(), generator.clone(), ledger.clone());
        let ultra = UltraRunner::new(
            db.clone(),
            generator.clone(),
            ledger.clone(),
            config.ultra_settings(),
        );
        let oral_exams = OralExamService::new(db.clone(), exam_llm, ledger.clone());
        crate::error::set_support_contact(&config.support_email);

        Self {
            db,
            config,
            ledger,
            study,
            ultra,
            oral_exams,
            stt,
        }
    }
}
