//! Journal entry composition: dictation, image OCR, and submission.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::core::errors::{SyncError, SyncResult};
use crate::messages::decoder::Utf8StreamDecoder;
use crate::notify::{Notice, NotificationSink};
use crate::speech::{Dictation, DraftBuffer, SpeechEvent, SpeechRecognizer};
use crate::transport::{CreatedEntry, JournalApi, StreamRequest, StreamingResponse, Transport};

const NO_IMAGE: &str = "No image has been captured.";
const NO_TEXT_IN_IMAGE: &str = "Could not extract any text from the image.";
const ENTRY_CREATED: &str = "Journal entry created successfully.";
const ENTRY_FAILED: &str = "An error occurred while creating the journal entry.";
const SPEECH_UNSUPPORTED: &str = "Speech recognition is not available.";

/// Builds a journal entry draft and submits it.
pub struct EntryComposerController {
    draft: DraftBuffer,
    dictation: Option<Dictation>,
    transport: Arc<dyn Transport>,
    api: Arc<dyn JournalApi>,
    sink: Arc<dyn NotificationSink>,
    ocr_path: String,
}

impl EntryComposerController {
    /// Controller sending OCR requests to `ocr_path`.
    pub fn new(
        transport: Arc<dyn Transport>,
        api: Arc<dyn JournalApi>,
        sink: Arc<dyn NotificationSink>,
        ocr_path: impl Into<String>,
    ) -> Self {
        Self {
            draft: DraftBuffer::new(),
            dictation: None,
            transport,
            api,
            sink,
            ocr_path: ocr_path.into(),
        }
    }

    /// Enable dictation through `recognizer`.
    #[must_use]
    pub fn with_recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.dictation = Some(Dictation::new(recognizer));
        self
    }

    /// Current draft.
    #[must_use]
    pub const fn draft(&self) -> &DraftBuffer {
        &self.draft
    }

    /// Replace the draft text (typing).
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.draft.set(text);
    }

    /// Whether dictation is running.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.dictation.as_ref().is_some_and(Dictation::is_listening)
    }

    /// Start or stop dictation, returning whether it is now listening.
    pub fn toggle_dictation(&mut self) -> bool {
        let Some(dictation) = self.dictation.as_mut() else {
            self.sink.notify(Notice::error(SPEECH_UNSUPPORTED));
            return false;
        };
        match dictation.toggle() {
            Ok(listening) => listening,
            Err(err) => {
                warn!(error = %err, "dictation failed to start");
                self.sink
                    .notify(Notice::error(format!("Speech recognition error: {err}")));
                false
            }
        }
    }

    /// Wait for the next dictation event and apply it to the draft.
    ///
    /// Returns `None` when dictation is not configured.
    pub async fn next_dictation_event(&mut self) -> Option<SpeechEvent> {
        let event = self.dictation.as_mut()?.next_event().await?;
        self.apply(&event);
        Some(event)
    }

    /// Apply every queued dictation event without waiting; returns how many.
    pub fn drain_dictation(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.dictation.as_mut().and_then(Dictation::try_next_event) {
            self.apply(&event);
            applied += 1;
        }
        applied
    }

    fn apply(&mut self, event: &SpeechEvent) {
        match event {
            SpeechEvent::Segment(text) => self.draft.append_segment(text),
            SpeechEvent::Error(reason) => self
                .sink
                .notify(Notice::error(format!("Speech recognition error: {reason}"))),
            SpeechEvent::Ended => debug!("dictation ended"),
        }
    }

    /// Send a captured image for OCR and append the recognized text.
    ///
    /// Returns the trimmed text that was appended (empty if none was found).
    ///
    /// # Errors
    /// Returns [`SyncError::EmptyInput`] for an empty image, or the transport
    /// error. Every failure is also reported to the sink.
    pub async fn scan_image(
        &mut self,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> SyncResult<String> {
        if bytes.is_empty() {
            self.sink.notify(Notice::error(NO_IMAGE));
            return Err(SyncError::EmptyInput);
        }

        let text = match self.read_ocr(file_name, mime, bytes).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "ocr failed");
                self.sink.notify(Notice::error(format!(
                    "An error occurred during OCR: {}",
                    err.user_message()
                )));
                return Err(err);
            }
        };

        let text = text.trim();
        if text.is_empty() {
            self.sink.notify(Notice::error(NO_TEXT_IN_IMAGE));
            return Ok(String::new());
        }
        self.draft.append_block(text);
        debug!(chars = text.chars().count(), "ocr text appended");
        Ok(text.to_string())
    }

    async fn read_ocr(&self, file_name: &str, mime: &str, bytes: Vec<u8>) -> SyncResult<String> {
        let request = StreamRequest::post_file(self.ocr_path.clone(), file_name, mime, bytes);
        let mut body = self
            .transport
            .open_stream(request)
            .await
            .and_then(StreamingResponse::into_body)?;

        let mut decoder = Utf8StreamDecoder::new();
        let mut text = String::new();
        while let Some(chunk) = body.next().await {
            text.push_str(&decoder.decode(&chunk?));
        }
        text.push_str(&decoder.finish());
        Ok(text)
    }

    /// Submit the draft as a new journal entry.
    ///
    /// On success the draft is cleared and the created entry (whose `id` is
    /// the poll target) is returned.
    ///
    /// # Errors
    /// Returns [`SyncError::EmptyInput`] for a blank draft, or the backend
    /// error. Every failure is also reported to the sink.
    pub async fn submit(&mut self) -> SyncResult<CreatedEntry> {
        if self.draft.is_blank() {
            self.sink
                .notify(Notice::error(SyncError::EmptyInput.user_message()));
            return Err(SyncError::EmptyInput);
        }

        match self.api.create_entry(self.draft.as_str()).await {
            Ok(entry) => {
                info!(entity_id = %entry.id, "journal entry created");
                self.sink.notify(Notice::success(ENTRY_CREATED));
                self.draft.clear();
                Ok(entry)
            }
            Err(err) => {
                warn!(error = %err, "journal entry rejected");
                let notice = match &err {
                    SyncError::Status { detail, .. } => {
                        let detail = if detail.is_empty() {
                            "Unknown error"
                        } else {
                            detail.as_str()
                        };
                        format!("Failed to create entry: {detail}")
                    }
                    _ => ENTRY_FAILED.to_string(),
                };
                self.sink.notify(Notice::error(notice));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::core::ids::EntityId;
    use crate::notify::{MemorySink, NoticeLevel};
    use crate::polling::entity::EntityFields;
    use crate::speech::tests::ScriptedRecognizer;
    use crate::transport::{RequestBody, TransportFuture};

    struct FakeBackend {
        ocr: Vec<Vec<u8>>,
        create: Mutex<Option<SyncResult<CreatedEntry>>>,
        submitted: Mutex<Vec<String>>,
        requests: Mutex<Vec<StreamRequest>>,
    }

    impl FakeBackend {
        fn new(ocr: Vec<Vec<u8>>, create: SyncResult<CreatedEntry>) -> Arc<Self> {
            Arc::new(Self {
                ocr,
                create: Mutex::new(Some(create)),
                submitted: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for FakeBackend {
        fn open_stream(
            &self,
            request: StreamRequest,
        ) -> TransportFuture<'_, SyncResult<StreamingResponse>> {
            self.requests.lock().unwrap().push(request);
            let chunks = self.ocr.iter().cloned().map(Ok).collect();
            Box::pin(async move { Ok(StreamingResponse::from_chunks(200, chunks)) })
        }
    }

    impl JournalApi for FakeBackend {
        fn create_entry<'a>(
            &'a self,
            content: &'a str,
        ) -> TransportFuture<'a, SyncResult<CreatedEntry>> {
            self.submitted.lock().unwrap().push(content.to_string());
            let result = self
                .create
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(SyncError::Cancelled));
            Box::pin(async move { result })
        }

        fn suggestions(&self) -> TransportFuture<'_, SyncResult<Vec<String>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn created(id: &str) -> CreatedEntry {
        CreatedEntry {
            id: EntityId::from(id),
            fields: EntityFields::from_value(json!({ "title": null })),
        }
    }

    fn composer(backend: &Arc<FakeBackend>) -> (EntryComposerController, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let controller = EntryComposerController::new(
            backend.clone(),
            backend.clone(),
            sink.clone(),
            "/journal/ocr",
        );
        (controller, sink)
    }

    #[tokio::test]
    async fn test_dictation_fills_draft() {
        let backend = FakeBackend::new(vec![], Ok(created("e1")));
        let (composer, sink) = composer(&backend);
        let recognizer = ScriptedRecognizer::new(vec![
            SpeechEvent::Segment("Today was".to_string()),
            SpeechEvent::Segment(" long. ".to_string()),
            SpeechEvent::Ended,
        ]);
        let mut composer = composer.with_recognizer(recognizer);

        assert!(composer.toggle_dictation());
        assert_eq!(composer.drain_dictation(), 3);
        assert_eq!(composer.draft().as_str(), "Today was long.");
        assert!(!composer.is_listening());
        assert!(sink.notices().is_empty());
    }

    #[tokio::test]
    async fn test_dictation_missing_is_reported() {
        let backend = FakeBackend::new(vec![], Ok(created("e1")));
        let (mut composer, sink) = composer(&backend);
        assert!(!composer.toggle_dictation());
        assert!(composer.next_dictation_event().await.is_none());
        assert_eq!(sink.notices()[0].message, SPEECH_UNSUPPORTED);
    }

    #[tokio::test]
    async fn test_ocr_text_joins_draft() {
        let backend = FakeBackend::new(
            vec![b"  caf".to_vec(), vec![0xC3], vec![0xA9, b' ', b'\n']],
            Ok(created("e1")),
        );
        let (mut composer, _) = composer(&backend);
        composer.set_text("Morning at the ");

        let text = composer
            .scan_image("capture.png", "image/png", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(text, "café");
        assert_eq!(composer.draft().as_str(), "Morning at the café");

        let request = backend.requests.lock().unwrap()[0].clone();
        assert_eq!(request.path, "/journal/ocr");
        assert!(matches!(request.body, RequestBody::File { ref field, .. } if field == "file"));
    }

    #[tokio::test]
    async fn test_ocr_without_text_is_reported() {
        let backend = FakeBackend::new(vec![b"  \n".to_vec()], Ok(created("e1")));
        let (mut composer, sink) = composer(&backend);
        composer.set_text("keep");

        let text = composer
            .scan_image("capture.png", "image/png", vec![1])
            .await
            .unwrap();
        assert!(text.is_empty());
        assert_eq!(composer.draft().as_str(), "keep");
        assert_eq!(sink.notices()[0].message, NO_TEXT_IN_IMAGE);

        assert!(composer.scan_image("x.png", "image/png", vec![]).await.is_err());
        assert_eq!(sink.notices()[1].message, NO_IMAGE);
    }

    #[tokio::test]
    async fn test_submit_creates_entry_and_clears_draft() {
        let backend = FakeBackend::new(vec![], Ok(created("e42")));
        let (mut composer, sink) = composer(&backend);
        composer.set_text("I walked by the river.");

        let entry = composer.submit().await.unwrap();
        assert_eq!(entry.id.as_str(), "e42");
        assert!(composer.draft().is_blank());
        assert_eq!(
            backend.submitted.lock().unwrap().as_slice(),
            ["I walked by the river.".to_string()]
        );
        assert_eq!(sink.notices()[0].level, NoticeLevel::Success);
    }

    #[tokio::test]
    async fn test_submit_blank_is_refused() {
        let backend = FakeBackend::new(vec![], Ok(created("e1")));
        let (mut composer, sink) = composer(&backend);
        composer.set_text("   ");
        assert!(matches!(composer.submit().await, Err(SyncError::EmptyInput)));
        assert!(backend.submitted.lock().unwrap().is_empty());
        assert_eq!(sink.notices()[0].message, "Please enter some text to submit.");
    }

    #[tokio::test]
    async fn test_submit_rejection_keeps_draft() {
        let backend = FakeBackend::new(
            vec![],
            Err(SyncError::Status {
                status: 422,
                detail: "Entry is too short.".to_string(),
            }),
        );
        let (mut composer, sink) = composer(&backend);
        composer.set_text("hi");

        assert!(composer.submit().await.is_err());
        assert_eq!(composer.draft().as_str(), "hi");
        assert_eq!(
            sink.notices()[0].message,
            "Failed to create entry: Entry is too short."
        );
    }
}
