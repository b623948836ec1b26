pub mod ascii;
pub mod credits;
pub mod domain;
pub mod generators;
pub mod memory;
pub mod oral_exam;
pub mod ports;
pub mod retry;
pub mod splitter;
pub mod study;
pub mod ultra;

#[cfg(test)]
pub(crate) mod testing;

pub use credits::{CreditLedger, Debit, LedgerError};
pub use domain::{
    Account, AccountCredentials, ArtifactKind, ArtifactPatch, Artifacts, AuthContext,
    AuthSession, CreditTransaction, JobStatus, LedgerEntryKind, OperationKind, OralExamMode,
    OralExamSession, OralExamStatus, PaymentEvent, PaymentProvider, Plan, ProcessingMetadata,
    StudySession, StudySessionSummary, UltraJob, UltraKind,
};
pub use generators::{ArtifactGenerator, GenerationError, TutorAnswer};
pub use memory::InMemoryStore;
pub use oral_exam::{OralExamError, OralExamService};
pub use ports::{
    DatabaseService, DebitOutcome, LanguageModelService, PortError, PortResult,
    SpeechToTextService,
};
pub use retry::RetryPolicy;
pub use study::{GeneratedArtifact, StudyError, StudyService, TutorReply};
pub use ultra::{UltraError, UltraRunner, UltraSettings};
