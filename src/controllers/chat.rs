//! Mind-search chat: stream assistant replies into the shared message log.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::MessageId;
use crate::messages::message::Role;
use crate::messages::reducer::{StreamOutcome, StreamingMessageReducer};
use crate::notify::{Notice, NotificationSink};
use crate::speech::SpeechSynthesizer;
use crate::transport::{JournalApi, StreamRequest, StreamingResponse, Transport};

const REQUEST_FAILED: &str = "An error occurred while fetching the response.";
const SYNTHESIS_FAILED: &str = "Failed to synthesize speech.";

/// Result of one [`MindSearchController::send`].
#[derive(Debug)]
pub struct ChatExchange {
    /// The user's message.
    pub user: MessageId,
    /// The assistant reply.
    pub reply: MessageId,
    /// How the reply stream ended.
    pub outcome: StreamOutcome,
}

/// Sends questions and streams the answers.
pub struct MindSearchController {
    reducer: Arc<StreamingMessageReducer>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn NotificationSink>,
    chat_path: String,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    api: Option<Arc<dyn JournalApi>>,
    suggestions: watch::Sender<Vec<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MindSearchController {
    /// Controller posting to `chat_path` through `transport`.
    pub fn new(
        reducer: Arc<StreamingMessageReducer>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn NotificationSink>,
        chat_path: impl Into<String>,
    ) -> Self {
        let (suggestions, _) = watch::channel(Vec::new());
        Self {
            reducer,
            transport,
            sink,
            chat_path: chat_path.into(),
            synthesizer: None,
            api: None,
            suggestions,
            task: Mutex::new(None),
        }
    }

    /// Synthesize audio for each completed reply.
    #[must_use]
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Refresh reply suggestions after each exchange.
    #[must_use]
    pub fn with_suggestions(mut self, api: Arc<dyn JournalApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// The message log writer.
    #[must_use]
    pub const fn reducer(&self) -> &Arc<StreamingMessageReducer> {
        &self.reducer
    }

    /// Latest reply suggestions.
    #[must_use]
    pub fn suggestions(&self) -> Vec<String> {
        self.suggestions.borrow().clone()
    }

    /// Receiver that wakes when suggestions change.
    #[must_use]
    pub fn watch_suggestions(&self) -> watch::Receiver<Vec<String>> {
        self.suggestions.subscribe()
    }

    /// Reload suggestions. Failures are logged and leave the old list.
    pub async fn refresh_suggestions(&self) {
        let Some(api) = &self.api else {
            return;
        };
        match api.suggestions().await {
            Ok(list) => {
                debug!(count = list.len(), "suggestions refreshed");
                self.suggestions.send_replace(list);
            }
            Err(err) => warn!(error = %err, "failed to fetch suggestions"),
        }
    }

    /// Ask a question and stream the answer to completion.
    ///
    /// Any stream still open from an earlier question is cancelled first. The
    /// assistant message is only created once a response body exists, so a
    /// failed request leaves just the user's message.
    ///
    /// # Errors
    /// Returns [`SyncError::EmptyInput`] for blank text, the transport error
    /// if the request could not be opened, or [`SyncError::ConcurrentStream`]
    /// if another reply started meanwhile. The last two are reported to the sink.
    pub async fn send(&self, text: &str) -> SyncResult<ChatExchange> {
        if text.trim().is_empty() {
            return Err(SyncError::EmptyInput);
        }
        self.reducer.cancel();
        let user = self.reducer.push_user(text);

        let request = StreamRequest::post_json(self.chat_path.clone(), json!({ "text": text }));
        let body = match self
            .transport
            .open_stream(request)
            .await
            .and_then(StreamingResponse::into_body)
        {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "chat request failed");
                self.sink.notify(Notice::error(REQUEST_FAILED));
                self.refresh_suggestions().await;
                return Err(err);
            }
        };

        let reply = match self.reducer.begin(Role::Assistant) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "reply could not be opened");
                self.sink.notify(Notice::error(err.user_message()));
                return Err(err);
            }
        };
        let outcome = self.reducer.consume(reply, body).await?;
        info!(message_id = %reply, ?outcome, "reply finished");

        if matches!(outcome, StreamOutcome::Completed) {
            self.speak(reply).await;
        }
        self.refresh_suggestions().await;

        Ok(ChatExchange {
            user,
            reply,
            outcome,
        })
    }

    /// Run [`send`](Self::send) in the background, replacing any earlier one.
    pub fn spawn_send(self: &Arc<Self>, text: impl Into<String>) {
        let this = Arc::clone(self);
        let text = text.into();
        let handle = tokio::spawn(async move {
            if let Err(err) = this.send(&text).await {
                debug!(error = %err, "background send ended with error");
            }
        });
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Whether a background send is still running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop the current exchange. Partial reply text stays in the log.
    pub fn cancel(&self) -> Option<MessageId> {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.reducer.cancel()
    }

    async fn speak(&self, reply: MessageId) {
        let Some(synthesizer) = &self.synthesizer else {
            return;
        };
        let Some(text) = self.reducer.claim_side_effect(reply) else {
            return;
        };
        match synthesizer.synthesize(&text).await {
            Ok(audio) => {
                if let Err(err) = self.reducer.attach_audio(reply, audio) {
                    debug!(message_id = %reply, error = %err, "reply gone before audio");
                }
            }
            Err(err) => {
                warn!(message_id = %reply, error = %err, "speech synthesis failed");
                self.sink.notify(Notice::error(SYNTHESIS_FAILED));
            }
        }
    }
}

impl Drop for MindSearchController {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::channel::mpsc;

    use super::*;
    use crate::messages::message::{AudioAttachment, MessageState};
    use crate::notify::{MemorySink, NoticeLevel};
    use crate::transport::{ChunkStream, CreatedEntry, RequestBody, TransportFuture};

    enum Reply {
        Chunks(Vec<SyncResult<Vec<u8>>>),
        Status(u16),
        Refused,
        Live(Mutex<Option<ChunkStream>>),
    }

    struct FakeChat {
        reply: Reply,
        requests: Mutex<Vec<StreamRequest>>,
    }

    impl FakeChat {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for FakeChat {
        fn open_stream(
            &self,
            request: StreamRequest,
        ) -> TransportFuture<'_, SyncResult<StreamingResponse>> {
            self.requests.lock().unwrap().push(request);
            let result = match &self.reply {
                Reply::Chunks(chunks) => Ok(StreamingResponse::from_chunks(
                    200,
                    chunks
                        .iter()
                        .map(|c| match c {
                            Ok(bytes) => Ok(bytes.clone()),
                            Err(_) => Err(SyncError::Transport("reset".to_string())),
                        })
                        .collect(),
                )),
                Reply::Status(status) => Ok(StreamingResponse::from_chunks(*status, vec![])),
                Reply::Refused => Err(SyncError::Transport("connection refused".to_string())),
                Reply::Live(body) => Ok(StreamingResponse {
                    status: 200,
                    body: body.lock().unwrap().take().unwrap(),
                }),
            };
            Box::pin(async move { result })
        }
    }

    #[derive(Default)]
    struct FakeSpeech {
        calls: AtomicUsize,
        fail: bool,
    }

    impl SpeechSynthesizer for FakeSpeech {
        fn synthesize<'a>(
            &'a self,
            _text: &'a str,
        ) -> TransportFuture<'a, SyncResult<AudioAttachment>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(SyncError::Status {
                        status: 500,
                        detail: String::new(),
                    });
                }
                Ok(AudioAttachment {
                    payload_base64: "AAEC".to_string(),
                    content_type: "audio/mpeg".to_string(),
                })
            })
        }
    }

    struct FakeSuggestions;

    impl JournalApi for FakeSuggestions {
        fn create_entry<'a>(
            &'a self,
            _content: &'a str,
        ) -> TransportFuture<'a, SyncResult<CreatedEntry>> {
            Box::pin(async { Err(SyncError::Cancelled) })
        }

        fn suggestions(&self) -> TransportFuture<'_, SyncResult<Vec<String>>> {
            Box::pin(async { Ok(vec!["What made me happy this week?".to_string()]) })
        }
    }

    fn controller(reply: Reply) -> (MindSearchController, Arc<MemorySink>, Arc<FakeChat>) {
        let sink = Arc::new(MemorySink::new());
        let reducer = Arc::new(StreamingMessageReducer::new(sink.clone()));
        let transport = FakeChat::new(reply);
        let controller =
            MindSearchController::new(reducer, transport.clone(), sink.clone(), "/query/chat");
        (controller, sink, transport)
    }

    #[tokio::test]
    async fn test_reply_streams_and_is_spoken_once() {
        let (controller, sink, transport) = controller(Reply::Chunks(vec![
            Ok(b"Rest ".to_vec()),
            Ok(b"more.".to_vec()),
        ]));
        let speech = Arc::new(FakeSpeech::default());
        let controller = controller
            .with_synthesizer(speech.clone())
            .with_suggestions(Arc::new(FakeSuggestions));

        let exchange = controller.send("How did I sleep?").await.unwrap();
        let reply = exchange.reply;

        let log = controller.reducer().snapshot();
        assert_eq!(log.len(), 2);
        assert_eq!(log.messages()[0].role, Role::User);
        assert_eq!(log.messages()[0].content, "How did I sleep?");
        let message = log.get(reply).unwrap();
        assert_eq!(message.content, "Rest more.");
        assert_eq!(message.state, MessageState::Closed);
        assert_eq!(message.attachment.as_ref().unwrap().content_type, "audio/mpeg");

        assert_eq!(speech.calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.reducer().claim_side_effect(reply), None);
        assert_eq!(controller.suggestions().len(), 1);
        assert!(sink.notices().is_empty());

        let request = transport.requests.lock().unwrap()[0].clone();
        assert_eq!(request.path, "/query/chat");
        assert_eq!(
            request.body,
            RequestBody::Json(json!({ "text": "How did I sleep?" }))
        );
    }

    #[tokio::test]
    async fn test_blank_input_sends_nothing() {
        let (controller, _, transport) = controller(Reply::Chunks(vec![]));
        assert!(matches!(
            controller.send("   ").await,
            Err(SyncError::EmptyInput)
        ));
        assert!(controller.reducer().snapshot().is_empty());
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refused_request_keeps_only_user_message() {
        let (controller, sink, _) = controller(Reply::Refused);
        assert!(controller.send("hello").await.is_err());

        let log = controller.reducer().snapshot();
        assert_eq!(log.len(), 1);
        assert_eq!(log.messages()[0].role, Role::User);
        let notices = sink.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (controller, sink, _) = controller(Reply::Status(401));
        let err = controller.send("hello").await.unwrap_err();
        assert!(matches!(err, SyncError::Status { status: 401, .. }));
        assert_eq!(controller.reducer().snapshot().len(), 1);
        assert_eq!(sink.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_partial_without_speech() {
        let (controller, sink, _) = controller(Reply::Chunks(vec![
            Ok(b"partial".to_vec()),
            Err(SyncError::Cancelled),
        ]));
        let speech = Arc::new(FakeSpeech::default());
        let controller = controller.with_synthesizer(speech.clone());

        let exchange = controller.send("hello").await.unwrap();
        assert!(matches!(exchange.outcome, StreamOutcome::Failed { .. }));
        let log = controller.reducer().snapshot();
        assert_eq!(log.get(exchange.reply).unwrap().content, "partial");
        assert_eq!(speech.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_reported() {
        let (controller, sink, _) = controller(Reply::Chunks(vec![Ok(b"ok".to_vec())]));
        let speech = Arc::new(FakeSpeech {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let controller = controller.with_synthesizer(speech);
        let exchange = controller.send("hello").await.unwrap();

        let log = controller.reducer().snapshot();
        assert!(log.get(exchange.reply).unwrap().attachment.is_none());
        assert_eq!(sink.notices()[0].message, SYNTHESIS_FAILED);
    }

    struct Interleaved {
        reducer: Arc<StreamingMessageReducer>,
    }

    impl Transport for Interleaved {
        fn open_stream(
            &self,
            _request: StreamRequest,
        ) -> TransportFuture<'_, SyncResult<StreamingResponse>> {
            let other = self.reducer.begin(Role::Assistant).map(|_| ());
            Box::pin(async move {
                other?;
                Ok(StreamingResponse::from_chunks(200, vec![Ok(b"late".to_vec())]))
            })
        }
    }

    #[tokio::test]
    async fn test_reply_opened_elsewhere_is_reported() {
        let sink = Arc::new(MemorySink::new());
        let reducer = Arc::new(StreamingMessageReducer::new(sink.clone()));
        let transport = Arc::new(Interleaved {
            reducer: Arc::clone(&reducer),
        });
        let controller = MindSearchController::new(reducer, transport, sink.clone(), "/query/chat");

        let err = controller.send("hello").await.unwrap_err();
        assert!(matches!(err, SyncError::ConcurrentStream(_)));

        let notices = sink.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
        assert_eq!(notices[0].message, err.user_message());
    }

    #[tokio::test]
    async fn test_cancel_freezes_partial_reply() {
        let (tx, rx) = mpsc::unbounded::<SyncResult<Vec<u8>>>();
        let body: ChunkStream = Box::pin(rx);
        let (controller, _, _) = controller(Reply::Live(Mutex::new(Some(body))));
        let controller = Arc::new(controller);
        let mut log = controller.reducer().subscribe();

        controller.spawn_send("tell me");
        tx.unbounded_send(Ok(b"Once ".to_vec())).unwrap();
        log.wait_for(|l| l.last().is_some_and(|m| m.content == "Once "))
            .await
            .unwrap();

        let reply = controller.cancel().unwrap();
        assert!(!controller.is_busy());
        let _ = tx.unbounded_send(Ok(b"upon".to_vec()));
        tokio::task::yield_now().await;

        let snapshot = controller.reducer().snapshot();
        let message = snapshot.get(reply).unwrap();
        assert_eq!(message.content, "Once ");
        assert!(message.was_cancelled());
        assert_eq!(snapshot.open_message(), None);
    }
}
