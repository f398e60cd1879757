//! Ordered, append-only message log for one conversational session.
//!
//! Readers get the full public API; every mutating method is crate-private
//! so that content only changes through [`StreamingMessageReducer`].
//!
//! [`StreamingMessageReducer`]: crate::messages::StreamingMessageReducer

use serde::Serialize;

use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::{ConversationId, MessageId};
use crate::messages::message::{AudioAttachment, Message, MessageState, Role};

/// Stream currently appending to the log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct OpenStream {
    pub(crate) message_id: MessageId,
    pub(crate) token: u64,
}

/// Messages in display order.
#[derive(Clone, Debug, Serialize)]
pub struct MessageLog {
    id: ConversationId,
    messages: Vec<Message>,
    #[serde(skip)]
    open: Option<OpenStream>,
    revision: u64,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ConversationId::new(),
            messages: Vec::new(),
            open: None,
            revision: 0,
        }
    }

    /// Conversation this log belongs to.
    #[must_use]
    pub const fn id(&self) -> ConversationId {
        self.id
    }

    /// Messages in insertion order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log has no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Most recent message.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Message currently receiving chunks, if any.
    #[must_use]
    pub fn open_message(&self) -> Option<MessageId> {
        self.open.map(|open| open.message_id)
    }

    /// Counter bumped by every successful mutation.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) const fn open_stream(&self) -> Option<OpenStream> {
        self.open
    }

    fn position(&self, id: MessageId) -> SyncResult<usize> {
        self.messages
            .iter()
            .position(|m| m.id == id)
            .ok_or(SyncError::UnknownMessage(id))
    }

    const fn bump(&mut self) {
        self.revision += 1;
    }

    pub(crate) fn push_user(&mut self, content: String) -> MessageId {
        let message = Message::user(content);
        let id = message.id;
        self.messages.push(message);
        self.bump();
        id
    }

    pub(crate) fn open(&mut self, role: Role, token: u64) -> SyncResult<MessageId> {
        if let Some(open) = self.open {
            return Err(SyncError::ConcurrentStream(open.message_id));
        }
        let message = Message::open(role);
        let id = message.id;
        self.messages.push(message);
        self.open = Some(OpenStream {
            message_id: id,
            token,
        });
        self.bump();
        Ok(id)
    }

    fn open_mut(&mut self, id: MessageId) -> SyncResult<&mut Message> {
        let index = self.position(id)?;
        let message = &mut self.messages[index];
        if message.state == MessageState::Closed {
            return Err(SyncError::StreamClosed(id));
        }
        Ok(message)
    }

    pub(crate) fn append(&mut self, id: MessageId, chunk: &str) -> SyncResult<()> {
        let message = self.open_mut(id)?;
        if chunk.is_empty() {
            return Ok(());
        }
        message.content.push_str(chunk);
        self.bump();
        Ok(())
    }

    pub(crate) fn close(&mut self, id: MessageId, cancelled: bool) -> SyncResult<&Message> {
        let index = self.position(id)?;
        {
            let message = &mut self.messages[index];
            if message.state == MessageState::Closed {
                return Err(SyncError::StreamClosed(id));
            }
            message.state = MessageState::Closed;
            message.cancelled = cancelled;
        }
        if self.open.is_some_and(|open| open.message_id == id) {
            self.open = None;
        }
        self.bump();
        Ok(&self.messages[index])
    }

    pub(crate) fn remove(&mut self, id: MessageId) -> SyncResult<Message> {
        let index = self.position(id)?;
        if self.open.is_some_and(|open| open.message_id == id) {
            self.open = None;
        }
        self.bump();
        Ok(self.messages.remove(index))
    }

    pub(crate) fn claim_side_effect(&mut self, id: MessageId) -> Option<String> {
        let index = self.position(id).ok()?;
        let message = &mut self.messages[index];
        if message.state != MessageState::Closed
            || message.cancelled
            || message.side_effect_claimed
            || message.content.trim().is_empty()
        {
            return None;
        }
        message.side_effect_claimed = true;
        Some(message.content.clone())
    }

    pub(crate) fn attach(&mut self, id: MessageId, attachment: AudioAttachment) -> SyncResult<()> {
        let index = self.position(id)?;
        self.messages[index].attachment = Some(attachment);
        self.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut log = MessageLog::new();
        let first = log.push_user("one".to_string());
        let second = log.open(Role::Assistant, 1).unwrap();
        let ids: Vec<MessageId> = log.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(log.open_message(), Some(second));
    }

    #[test]
    fn test_closed_message_rejects_append() {
        let mut log = MessageLog::new();
        let id = log.open(Role::Assistant, 1).unwrap();
        log.append(id, "hi").unwrap();
        log.close(id, false).unwrap();
        assert!(matches!(log.append(id, "!"), Err(SyncError::StreamClosed(_))));
        assert!(matches!(log.close(id, false), Err(SyncError::StreamClosed(_))));
        assert_eq!(log.get(id).unwrap().content, "hi");
        assert_eq!(log.open_message(), None);
    }

    #[test]
    fn test_user_messages_are_immutable() {
        let mut log = MessageLog::new();
        let id = log.push_user("fixed".to_string());
        assert!(log.append(id, "more").is_err());
        assert_eq!(log.get(id).unwrap().content, "fixed");
    }

    #[test]
    fn test_revision_bumps_only_on_change() {
        let mut log = MessageLog::new();
        let id = log.open(Role::Assistant, 1).unwrap();
        let before = log.revision();
        log.append(id, "").unwrap();
        assert_eq!(log.revision(), before);
        log.append(id, "x").unwrap();
        assert_eq!(log.revision(), before + 1);
    }
}
