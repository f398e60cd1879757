//! Speech capabilities: dictation input and reply synthesis.
//!
//! Recognizers push [`SpeechEvent`]s into a channel owned by the consumer.
//! The channel outlives every `start`/`stop` cycle, so the consumer never
//! re-registers handlers when dictation restarts.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::errors::SyncResult;
use crate::messages::message::AudioAttachment;
use crate::transport::TransportFuture;

/// Output of a speech recognizer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpeechEvent {
    /// A finalized piece of transcribed text.
    Segment(String),
    /// Recognition failed; dictation has stopped.
    Error(String),
    /// Recognition ended normally.
    Ended,
}

/// Continuous speech-to-text.
pub trait SpeechRecognizer: Send + Sync {
    /// Begin emitting events into `events`.
    ///
    /// # Errors
    /// Returns an error if recognition cannot start.
    fn start(&self, events: mpsc::UnboundedSender<SpeechEvent>) -> SyncResult<()>;

    /// Stop emitting events. Idempotent.
    fn stop(&self);
}

/// Text-to-speech for finished replies.
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into an audio attachment.
    ///
    /// # Errors
    /// Returns an error if the backend rejects the request.
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
    ) -> TransportFuture<'a, SyncResult<AudioAttachment>>;
}

/// Recognizer that treats each line of standard input as a spoken segment.
#[derive(Debug, Default)]
pub struct StdinRecognizer {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StdinRecognizer {
    /// Create an idle recognizer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpeechRecognizer for StdinRecognizer {
    fn start(&self, events: mpsc::UnboundedSender<SpeechEvent>) -> SyncResult<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        *task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let event = match lines.next_line().await {
                    Ok(Some(line)) => SpeechEvent::Segment(line),
                    Ok(None) => SpeechEvent::Ended,
                    Err(err) => SpeechEvent::Error(err.to_string()),
                };
                let last = !matches!(event, SpeechEvent::Segment(_));
                if events.send(event).is_err() || last {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Text being composed before submission.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DraftBuffer {
    text: String,
}

impl DraftBuffer {
    /// Empty draft.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            text: String::new(),
        }
    }

    /// Current text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the draft is blank.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Replace the text (manual edits).
    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Clear the draft.
    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Append a dictated segment, separated by one space when the draft
    /// already has content. Blank segments are ignored.
    pub fn append_segment(&mut self, segment: &str) {
        let segment = segment.trim();
        if segment.is_empty() {
            return;
        }
        if !self.text.trim().is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(segment);
    }

    /// Append a block of recognized text (OCR): both sides are trimmed and
    /// joined with one space.
    pub fn append_block(&mut self, block: &str) {
        let block = block.trim();
        let current = self.text.trim();
        self.text = match (current.is_empty(), block.is_empty()) {
            (_, true) => current.to_string(),
            (true, false) => block.to_string(),
            (false, false) => format!("{current} {block}"),
        };
    }
}

/// Dictation session owned by a controller.
pub struct Dictation {
    recognizer: Arc<dyn SpeechRecognizer>,
    sender: mpsc::UnboundedSender<SpeechEvent>,
    events: mpsc::UnboundedReceiver<SpeechEvent>,
    listening: bool,
}

impl std::fmt::Debug for Dictation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dictation")
            .field("listening", &self.listening)
            .finish_non_exhaustive()
    }
}

impl Dictation {
    /// Wrap a recognizer.
    #[must_use]
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        Self {
            recognizer,
            sender,
            events,
            listening: false,
        }
    }

    /// Whether the recognizer is running.
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    /// Start listening. A no-op while already listening.
    ///
    /// # Errors
    /// Returns the recognizer's error if it cannot start.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.listening {
            return Ok(());
        }
        self.recognizer.start(self.sender.clone())?;
        self.listening = true;
        debug!("dictation started");
        Ok(())
    }

    /// Stop listening. Segments already queued can still be read.
    pub fn stop(&mut self) {
        if self.listening {
            self.recognizer.stop();
            self.listening = false;
            debug!("dictation stopped");
        }
    }

    /// Toggle listening, returning the new state.
    ///
    /// # Errors
    /// Returns the recognizer's error if it cannot start.
    pub fn toggle(&mut self) -> SyncResult<bool> {
        if self.listening {
            self.stop();
        } else {
            self.start()?;
        }
        Ok(self.listening)
    }

    /// Wait for the next event. `Ended` and `Error` mark dictation stopped.
    pub async fn next_event(&mut self) -> Option<SpeechEvent> {
        let event = self.events.recv().await;
        self.observe(event.as_ref());
        event
    }

    /// Next queued event without waiting.
    pub fn try_next_event(&mut self) -> Option<SpeechEvent> {
        let event = self.events.try_recv().ok();
        self.observe(event.as_ref());
        event
    }

    fn observe(&mut self, event: Option<&SpeechEvent>) {
        match event {
            Some(SpeechEvent::Ended) => self.listening = false,
            Some(SpeechEvent::Error(reason)) => {
                warn!(%reason, "dictation failed");
                self.listening = false;
            }
            _ => {}
        }
    }
}

impl Drop for Dictation {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Emits its script on every `start`.
    pub(crate) struct ScriptedRecognizer {
        script: Vec<SpeechEvent>,
        pub(crate) starts: AtomicUsize,
        pub(crate) stops: AtomicUsize,
    }

    impl ScriptedRecognizer {
        pub(crate) fn new(script: Vec<SpeechEvent>) -> Arc<Self> {
            Arc::new(Self {
                script,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl SpeechRecognizer for ScriptedRecognizer {
        fn start(&self, events: mpsc::UnboundedSender<SpeechEvent>) -> SyncResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            for event in &self.script {
                let _ = events.send(event.clone());
            }
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_segment_separator() {
        let mut draft = DraftBuffer::new();
        draft.append_segment("I slept");
        draft.append_segment(" badly ");
        assert_eq!(draft.as_str(), "I slept badly");

        let mut draft = DraftBuffer::new();
        draft.set("Ends with space ");
        draft.append_segment("ok");
        assert_eq!(draft.as_str(), "Ends with space  ok");

        draft.append_segment("   ");
        assert_eq!(draft.as_str(), "Ends with space  ok");
    }

    #[test]
    fn test_block_join() {
        let mut draft = DraftBuffer::new();
        draft.append_block("  scanned page \n");
        assert_eq!(draft.as_str(), "scanned page");

        draft.set("typed text  ");
        draft.append_block("\nfrom photo ");
        assert_eq!(draft.as_str(), "typed text from photo");
        assert!(!draft.is_blank());

        draft.clear();
        assert!(draft.is_blank());
    }

    #[tokio::test]
    async fn test_dictation_channel_survives_restart() {
        let recognizer = ScriptedRecognizer::new(vec![
            SpeechEvent::Segment("one".to_string()),
            SpeechEvent::Ended,
        ]);
        let mut dictation = Dictation::new(recognizer.clone());

        dictation.start().unwrap();
        dictation.start().unwrap();
        assert_eq!(recognizer.starts.load(Ordering::SeqCst), 1);

        assert_eq!(
            dictation.next_event().await,
            Some(SpeechEvent::Segment("one".to_string()))
        );
        assert!(dictation.is_listening());
        assert_eq!(dictation.next_event().await, Some(SpeechEvent::Ended));
        assert!(!dictation.is_listening());

        assert!(dictation.toggle().unwrap());
        assert_eq!(recognizer.starts.load(Ordering::SeqCst), 2);
        assert_eq!(
            dictation.try_next_event(),
            Some(SpeechEvent::Segment("one".to_string()))
        );
        assert!(!dictation.toggle().unwrap());
        assert_eq!(recognizer.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_stops_listening() {
        let recognizer = ScriptedRecognizer::new(vec![SpeechEvent::Error("denied".to_string())]);
        let mut dictation = Dictation::new(recognizer);
        dictation.start().unwrap();
        assert!(matches!(dictation.try_next_event(), Some(SpeechEvent::Error(_))));
        assert!(!dictation.is_listening());
    }
}
