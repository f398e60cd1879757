//! Conversational message log and the streaming reducer that writes to it.
//!
//! - `message`: message, role, and audio attachment types
//! - `decoder`: incremental UTF-8 decoding of streamed bytes
//! - `log`: the ordered, append-only log (read-only outside this module)
//! - `reducer`: the single entry point that mutates the log

pub mod decoder;
pub mod log;
pub mod message;
pub mod reducer;

pub use decoder::Utf8StreamDecoder;
pub use log::MessageLog;
pub use message::{AudioAttachment, Message, MessageState, Role};
pub use reducer::{FailOutcome, StreamOutcome, StreamingMessageReducer};
