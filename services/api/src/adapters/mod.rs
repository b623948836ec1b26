pub mod db;
pub mod llm;
pub mod sst;

pub use db::DbAdapter;
pub use llm::OpenAiLanguageModelAdapter;
pub use sst::OpenAiSstAdapter;
