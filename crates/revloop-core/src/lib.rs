pub mod config;
pub mod error;
pub mod event;
pub mod review;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, RevloopError};
pub use event::EventBus;
pub use review::{Decision, ReviewPolicy, ReviewSession, ReviewStatus, SessionSnapshot, Verdict};
pub use types::*;
