//! Streaming reducer: turns arriving chunks into one growing message.
//!
//! The log lives inside a `tokio::sync::watch` channel. Every entry point
//! runs its mutation under the channel lock and publishes a new revision
//! only when something changed, so observers never see half-applied
//! appends and rejected calls are invisible.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::MessageId;
use crate::messages::decoder::Utf8StreamDecoder;
use crate::messages::log::{MessageLog, OpenStream};
use crate::messages::message::{AudioAttachment, Role};
use crate::notify::{Notice, NotificationSink};
use crate::transport::ChunkStream;

/// What `fail` did with the partial message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailOutcome {
    /// The message had no content and was removed from the log.
    Discarded,
    /// The message kept its partial content and was closed.
    KeptPartial,
}

/// How a read loop ended.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The body ended and the message was closed.
    Completed,
    /// The stream was cancelled; the log was left as the cancel left it.
    Cancelled,
    /// The transport failed mid-stream.
    Failed {
        /// What happened to the partial message.
        outcome: FailOutcome,
        /// The transport error.
        error: SyncError,
    },
}

/// Single-writer reducer over one [`MessageLog`].
pub struct StreamingMessageReducer {
    log: watch::Sender<MessageLog>,
    next_token: AtomicU64,
    sink: Arc<dyn NotificationSink>,
}

impl StreamingMessageReducer {
    /// Create a reducer over a fresh, empty log.
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        let (log, _) = watch::channel(MessageLog::new());
        Self {
            log,
            next_token: AtomicU64::new(1),
            sink,
        }
    }

    /// Observe the log; the receiver wakes after every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MessageLog> {
        self.log.subscribe()
    }

    /// Clone of the current log.
    #[must_use]
    pub fn snapshot(&self) -> MessageLog {
        self.log.borrow().clone()
    }

    /// Read the current log without cloning it.
    pub fn with_log<R>(&self, read: impl FnOnce(&MessageLog) -> R) -> R {
        read(&self.log.borrow())
    }

    fn mutate<R>(&self, change: impl FnOnce(&mut MessageLog) -> SyncResult<R>) -> SyncResult<R> {
        let mut result = Err(SyncError::Cancelled);
        self.log.send_if_modified(|log| {
            let before = log.revision();
            result = change(log);
            log.revision() != before
        });
        result
    }

    /// Append an immutable user message.
    pub fn push_user(&self, content: impl Into<String>) -> MessageId {
        let content = content.into();
        let mut id = None;
        self.log.send_modify(|log| id = Some(log.push_user(content)));
        // send_modify always runs the closure.
        id.unwrap_or_default()
    }

    /// Append an empty open message and start a stream on it.
    ///
    /// # Errors
    /// Returns [`SyncError::ConcurrentStream`] if a stream is already open;
    /// the log is left unchanged.
    pub fn begin(&self, role: Role) -> SyncResult<MessageId> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let id = self.mutate(|log| log.open(role, token))?;
        debug!(message_id = %id, %role, token, "stream opened");
        Ok(id)
    }

    /// Append text to an open message.
    ///
    /// # Errors
    /// Returns [`SyncError::StreamClosed`] if the message is closed, or
    /// [`SyncError::UnknownMessage`] if it is not in the log.
    pub fn append(&self, id: MessageId, chunk: &str) -> SyncResult<()> {
        self.mutate(|log| log.append(id, chunk))
    }

    fn append_current(&self, stream: OpenStream, chunk: &str) -> SyncResult<()> {
        self.mutate(|log| {
            if log.open_stream() != Some(stream) {
                return Err(SyncError::Cancelled);
            }
            log.append(stream.message_id, chunk)
        })
    }

    /// Close a message; it becomes eligible for the completion side effect.
    ///
    /// # Errors
    /// Returns [`SyncError::StreamClosed`] if the message is already closed.
    pub fn end(&self, id: MessageId) -> SyncResult<()> {
        let chars = self.mutate(|log| log.close(id, false).map(|m| m.content.chars().count()))?;
        debug!(message_id = %id, chars, "stream closed");
        Ok(())
    }

    /// Handle a transport failure on an open message.
    ///
    /// An empty message is removed; a message with content keeps it and is
    /// closed. Either way the notification sink receives an error notice.
    ///
    /// # Errors
    /// Returns [`SyncError::StreamClosed`] if the message is already closed.
    pub fn fail(&self, id: MessageId, reason: &SyncError) -> SyncResult<FailOutcome> {
        let outcome = self.mutate(|log| {
            let message = log.get(id).ok_or(SyncError::UnknownMessage(id))?;
            if !message.is_open() {
                return Err(SyncError::StreamClosed(id));
            }
            if message.content.is_empty() {
                log.remove(id)?;
                Ok(FailOutcome::Discarded)
            } else {
                log.close(id, false)?;
                Ok(FailOutcome::KeptPartial)
            }
        })?;
        warn!(message_id = %id, ?outcome, error = %reason, "stream failed");
        self.sink
            .notify(Notice::error("An error occurred while fetching the response."));
        Ok(outcome)
    }

    /// Cancel the open stream, if any.
    ///
    /// A [`consume`](Self::consume) loop reading it stops even while the
    /// transport is silent, and drops the body. A cancelled message never triggers
    /// the completion side effect, and an empty one is removed. Calling this
    /// with nothing open is a no-op.
    pub fn cancel(&self) -> Option<MessageId> {
        let cancelled = self
            .mutate(|log| {
                let open = log.open_stream().ok_or(SyncError::Cancelled)?;
                let id = open.message_id;
                let empty = log.get(id).is_some_and(|m| m.content.is_empty());
                if empty {
                    log.remove(id)?;
                } else {
                    log.close(id, true)?;
                }
                Ok(id)
            })
            .ok();
        if let Some(id) = cancelled {
            info!(message_id = %id, "stream cancelled");
        }
        cancelled
    }

    /// Take the finished text of a message for its one-time side effect.
    ///
    /// Returns `None` if the message is open, empty, cancelled, unknown, or
    /// already claimed.
    pub fn claim_side_effect(&self, id: MessageId) -> Option<String> {
        let mut claimed = None;
        self.log.send_if_modified(|log| {
            claimed = log.claim_side_effect(id);
            false
        });
        claimed
    }

    /// Attach synthesized audio to a message.
    ///
    /// # Errors
    /// Returns [`SyncError::UnknownMessage`] if the message is not in the log.
    pub fn attach_audio(&self, id: MessageId, attachment: AudioAttachment) -> SyncResult<()> {
        self.mutate(|log| log.attach(id, attachment))
    }

    /// Read loop: decode `body` into the open message `id` until it ends.
    ///
    /// Ends the message when the body completes and calls [`fail`] on a
    /// transport error. If the stream is cancelled meanwhile, the loop stops
    /// at once without touching the log and the body is dropped.
    ///
    /// # Errors
    /// Returns [`SyncError::StreamClosed`] if `id` is not the open stream.
    ///
    /// [`fail`]: Self::fail
    pub async fn consume(
        &self,
        id: MessageId,
        mut body: ChunkStream,
    ) -> SyncResult<StreamOutcome> {
        let stream = self
            .with_log(|log| log.open_stream().filter(|open| open.message_id == id))
            .ok_or(SyncError::StreamClosed(id))?;

        let mut observer = self.log.subscribe();
        let mut decoder = Utf8StreamDecoder::new();
        let mut chunks = 0_u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = observer.wait_for(|log| log.open_stream() != Some(stream)) => {
                    debug!(message_id = %id, chunks, "stream cancelled while waiting for data");
                    return Ok(StreamOutcome::Cancelled);
                }
                next = body.next() => next,
            };
            let Some(next) = next else {
                break;
            };
            match next {
                Ok(bytes) => {
                    let text = decoder.decode(&bytes);
                    if self.append_current(stream, &text).is_err() {
                        debug!(message_id = %id, chunks, "stream no longer current");
                        return Ok(StreamOutcome::Cancelled);
                    }
                    chunks += 1;
                }
                Err(error) => {
                    let tail = decoder.finish();
                    if self.append_current(stream, &tail).is_err() {
                        return Ok(StreamOutcome::Cancelled);
                    }
                    let outcome = self.fail(id, &error)?;
                    return Ok(StreamOutcome::Failed { outcome, error });
                }
            }
        }

        let tail = decoder.finish();
        if self.append_current(stream, &tail).is_err() {
            return Ok(StreamOutcome::Cancelled);
        }
        self.end(id)?;
        debug!(message_id = %id, chunks, "stream completed");
        Ok(StreamOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::channel::mpsc;
    use futures::stream;

    use super::*;
    use crate::messages::message::MessageState;
    use crate::notify::{MemorySink, NoticeLevel};

    fn reducer() -> (Arc<StreamingMessageReducer>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let reducer = Arc::new(StreamingMessageReducer::new(sink.clone()));
        (reducer, sink)
    }

    fn body(chunks: Vec<SyncResult<Vec<u8>>>) -> ChunkStream {
        Box::pin(stream::iter(chunks))
    }

    #[test]
    fn test_hello_scenario() {
        let (reducer, _) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        reducer.append(id, "He").unwrap();
        reducer.append(id, "llo").unwrap();
        reducer.end(id).unwrap();

        let log = reducer.snapshot();
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(id).unwrap().content, "Hello");
        assert_eq!(log.get(id).unwrap().state, MessageState::Closed);
    }

    #[test]
    fn test_second_begin_rejected_and_log_unchanged() {
        let (reducer, _) = reducer();
        let first = reducer.begin(Role::Assistant).unwrap();
        let before = reducer.snapshot();

        let err = reducer.begin(Role::Assistant).unwrap_err();
        assert!(matches!(err, SyncError::ConcurrentStream(open) if open == first));

        let after = reducer.snapshot();
        assert_eq!(after.len(), before.len());
        assert_eq!(after.revision(), before.revision());

        reducer.end(first).unwrap();
        assert!(reducer.begin(Role::Assistant).is_ok());
    }

    #[test]
    fn test_append_after_end_fails() {
        let (reducer, _) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        reducer.end(id).unwrap();
        assert!(matches!(reducer.append(id, "late"), Err(SyncError::StreamClosed(_))));
        assert!(matches!(reducer.end(id), Err(SyncError::StreamClosed(_))));
    }

    #[test]
    fn test_fail_discards_empty_message() {
        let (reducer, sink) = reducer();
        reducer.push_user("question");
        let id = reducer.begin(Role::Assistant).unwrap();

        let outcome = reducer
            .fail(id, &SyncError::Transport("reset".to_string()))
            .unwrap();
        assert_eq!(outcome, FailOutcome::Discarded);

        let log = reducer.snapshot();
        assert_eq!(log.len(), 1);
        assert!(log.get(id).is_none());
        assert_eq!(log.open_message(), None);
        assert_eq!(sink.notices()[0].level, NoticeLevel::Error);
    }

    #[test]
    fn test_fail_keeps_partial_content() {
        let (reducer, sink) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        reducer.append(id, "p").unwrap();

        let outcome = reducer
            .fail(id, &SyncError::Transport("reset".to_string()))
            .unwrap();
        assert_eq!(outcome, FailOutcome::KeptPartial);

        let message = reducer.snapshot().get(id).cloned().unwrap();
        assert_eq!(message.content, "p");
        assert!(!message.is_open());
        assert_eq!(sink.notices().len(), 1);
        assert!(reducer.append(id, "q").is_err());
    }

    #[test]
    fn test_side_effect_claimed_once() {
        let (reducer, _) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        reducer.append(id, "Sleep well.").unwrap();
        assert_eq!(reducer.claim_side_effect(id), None);

        reducer.end(id).unwrap();
        assert_eq!(reducer.claim_side_effect(id).as_deref(), Some("Sleep well."));
        assert_eq!(reducer.claim_side_effect(id), None);
    }

    #[test]
    fn test_cancel_is_idempotent_and_blocks_side_effect() {
        let (reducer, _) = reducer();
        assert_eq!(reducer.cancel(), None);

        let id = reducer.begin(Role::Assistant).unwrap();
        reducer.append(id, "half").unwrap();
        assert_eq!(reducer.cancel(), Some(id));
        assert_eq!(reducer.cancel(), None);

        let message = reducer.snapshot().get(id).cloned().unwrap();
        assert!(message.was_cancelled());
        assert_eq!(reducer.claim_side_effect(id), None);
        assert!(reducer.append(id, "more").is_err());
    }

    #[test]
    fn test_cancel_removes_empty_message() {
        let (reducer, _) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        reducer.cancel();
        assert!(reducer.snapshot().is_empty());
        assert!(reducer.snapshot().get(id).is_none());
    }

    #[test]
    fn test_attach_audio() {
        let (reducer, _) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        reducer.append(id, "hi").unwrap();
        reducer.end(id).unwrap();
        reducer
            .attach_audio(
                id,
                AudioAttachment {
                    payload_base64: "SUQz".to_string(),
                    content_type: "audio/mpeg".to_string(),
                },
            )
            .unwrap();
        let message = reducer.snapshot().get(id).cloned().unwrap();
        assert_eq!(message.attachment.unwrap().content_type, "audio/mpeg");
    }

    #[tokio::test]
    async fn test_consume_preserves_split_multibyte_chars() {
        let (reducer, _) = reducer();
        let text = "Tu as écrit: « bonne nuit » 🌙";
        let bytes = text.as_bytes();
        let chunks: Vec<SyncResult<Vec<u8>>> = bytes.chunks(3).map(|c| Ok(c.to_vec())).collect();

        let id = reducer.begin(Role::Assistant).unwrap();
        let outcome = reducer.consume(id, body(chunks)).await.unwrap();

        assert!(matches!(outcome, StreamOutcome::Completed));
        let message = reducer.snapshot().get(id).cloned().unwrap();
        assert_eq!(message.content, text);
        assert!(!message.is_open());
    }

    #[tokio::test]
    async fn test_consume_transport_error_keeps_partial() {
        let (reducer, sink) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        let outcome = reducer
            .consume(
                id,
                body(vec![
                    Ok(b"Part".to_vec()),
                    Err(SyncError::Transport("connection reset".to_string())),
                    Ok(b"never".to_vec()),
                ]),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StreamOutcome::Failed {
                outcome: FailOutcome::KeptPartial,
                ..
            }
        ));
        assert_eq!(reducer.snapshot().get(id).unwrap().content, "Part");
        assert_eq!(sink.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_error_before_content_discards() {
        let (reducer, _) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        let outcome = reducer
            .consume(id, body(vec![Err(SyncError::Transport("refused".to_string()))]))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            StreamOutcome::Failed {
                outcome: FailOutcome::Discarded,
                ..
            }
        ));
        assert!(reducer.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_late_chunks_after_cancel_are_dropped() {
        let (reducer, _) = reducer();
        let (tx, rx) = mpsc::unbounded::<SyncResult<Vec<u8>>>();
        let id = reducer.begin(Role::Assistant).unwrap();

        let worker = {
            let reducer = Arc::clone(&reducer);
            tokio::spawn(async move { reducer.consume(id, Box::pin(rx)).await })
        };

        let mut observer = reducer.subscribe();
        tx.unbounded_send(Ok(b"Hel".to_vec())).unwrap();
        observer
            .wait_for(|log| log.get(id).is_some_and(|m| m.content == "Hel"))
            .await
            .unwrap();

        assert_eq!(reducer.cancel(), Some(id));
        tx.unbounded_send(Ok(b"lo".to_vec())).unwrap();
        drop(tx);

        let outcome = worker.await.unwrap().unwrap();
        assert!(matches!(outcome, StreamOutcome::Cancelled));
        assert_eq!(reducer.snapshot().get(id).unwrap().content, "Hel");
    }

    #[tokio::test]
    async fn test_cancel_stops_silent_read_loop() {
        let (reducer, _) = reducer();
        let id = reducer.begin(Role::Assistant).unwrap();
        let silent: ChunkStream = Box::pin(stream::pending::<SyncResult<Vec<u8>>>());

        let (outcome, cancelled) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(reducer.consume(id, silent), async {
                tokio::task::yield_now().await;
                reducer.cancel()
            })
        })
        .await
        .expect("read loop kept waiting after cancel");

        assert_eq!(cancelled, Some(id));
        assert!(matches!(outcome.unwrap(), StreamOutcome::Cancelled));
        assert!(reducer.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_observer_sees_growing_content() {
        let (reducer, _) = reducer();
        let mut observer = reducer.subscribe();
        let id = reducer.begin(Role::Assistant).unwrap();
        assert!(observer.has_changed().unwrap());
        observer.borrow_and_update();

        reducer.append(id, "a").unwrap();
        assert!(observer.has_changed().unwrap());
        assert_eq!(observer.borrow_and_update().get(id).unwrap().content, "a");

        assert!(reducer.append(id, "").is_ok());
        assert!(!observer.has_changed().unwrap());
    }
}
