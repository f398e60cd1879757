//! View controllers built on the message reducer and the poll reconciler.
//!
//! - `chat`: mind-search question and streamed answer
//! - `entry`: draft composition (dictation, OCR) and submission
//! - `insights`: entry result and insights views that poll for enrichment

pub mod chat;
pub mod entry;
pub mod insights;

pub use chat::{ChatExchange, MindSearchController};
pub use entry::EntryComposerController;
pub use insights::{InsightsController, InsightsView};
