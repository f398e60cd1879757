//! Polling reconciliation of server-enriched entities.
//!
//! - `entity`: field maps, completion predicates, and journal entry fields
//! - `reconciler`: per-entity poll sessions with cancellation

pub mod entity;
pub mod reconciler;

pub use entity::{
    CompletionPredicate, ENTRY_FIELD_SET_VERSION, EntityFields, EntryField, EntryInsights,
    PollableEntity,
};
pub use reconciler::{PollHandle, PollNotification, PollSession, PollStart, PollingReconciler};
