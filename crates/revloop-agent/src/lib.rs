pub mod ask;
pub mod checkpoint;
pub mod generator;
pub mod orchestrator;
pub mod sql_agent;
pub mod store;

pub use ask::AskAgent;
pub use checkpoint::SqliteReviewStore;
pub use generator::LlmGenerator;
pub use orchestrator::ReviewOrchestrator;
pub use sql_agent::SqlAgent;
pub use store::MemoryReviewStore;
