//! Core types shared by every module: configuration, errors, and identifiers.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::{ApiConfig, ClientConfig, PollingConfig, PollingConfigBuilder, SpeechConfig};
pub use errors::{SyncError, SyncResult};
pub use ids::{ConversationId, EntityId, MessageId};
