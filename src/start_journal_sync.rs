//! Startup helpers for the journal sync command-line client.
//!
//! `journal-sync chat` streams mind-search answers for each stdin line,
//! `journal-sync submit` creates an entry and waits for its title,
//! `journal-sync ocr <image>` prints the text found in an image, and
//! `journal-sync watch <id>` follows an entry until it is enriched.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::controllers::{
    EntryComposerController, InsightsController, InsightsView, MindSearchController,
};
use crate::core::config::ClientConfig;
use crate::core::errors::SyncResult;
use crate::core::ids::{EntityId, MessageId};
use crate::messages::log::MessageLog;
use crate::messages::message::Role;
use crate::messages::reducer::StreamingMessageReducer;
use crate::notify::{NotificationSink, TracingSink};
use crate::polling::reconciler::PollingReconciler;
use crate::speech::StdinRecognizer;
use crate::transport::{HttpTransport, StaticCredential};

/// Environment variable holding the bearer token.
pub const ENV_TOKEN: &str = "JOURNAL_SYNC_TOKEN";

/// Wires the HTTP transport into the engines and controllers.
pub struct JournalClient {
    config: ClientConfig,
    http: Arc<HttpTransport>,
    sink: Arc<dyn NotificationSink>,
    reconciler: Arc<PollingReconciler>,
}

impl JournalClient {
    /// Build a client from validated configuration and an optional token.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ClientConfig, token: Option<String>) -> SyncResult<Self> {
        config.validate()?;
        let mut http = HttpTransport::new(config.api.clone())?;
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            http = http.with_credential(Arc::new(StaticCredential::new(token)));
        }
        let http = Arc::new(http);
        let reconciler = Arc::new(PollingReconciler::new(http.clone(), config.polling.clone()));
        Ok(Self {
            config,
            http,
            sink: Arc::new(TracingSink),
            reconciler,
        })
    }

    /// Route notices somewhere other than the log.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared poll reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &Arc<PollingReconciler> {
        &self.reconciler
    }

    /// Mind-search controller with its own message log.
    #[must_use]
    pub fn mind_search(&self) -> MindSearchController {
        let reducer = Arc::new(StreamingMessageReducer::new(self.sink.clone()));
        let controller = MindSearchController::new(
            reducer,
            self.http.clone(),
            self.sink.clone(),
            self.config.api.chat_path.clone(),
        )
        .with_suggestions(self.http.clone());
        if self.config.speech.synthesize_replies {
            controller.with_synthesizer(self.http.clone())
        } else {
            controller
        }
    }

    /// Entry composer.
    #[must_use]
    pub fn composer(&self) -> EntryComposerController {
        EntryComposerController::new(
            self.http.clone(),
            self.http.clone(),
            self.sink.clone(),
            self.config.api.ocr_path.clone(),
        )
    }

    /// Result or insights view.
    #[must_use]
    pub fn insights(&self, view: InsightsView) -> InsightsController {
        InsightsController::new(self.reconciler.clone(), view)
    }
}

/// Initialize the tracing subscriber (`RUST_LOG` overrides the `info` default).
pub fn init_tracing() {
    // Ignore the error when a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "journal-sync", version)]
#[command(about = "Journaling client: mind search, entry capture, enrichment")]
pub struct Cli {
    /// Selected subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Interactive mind search, one question per stdin line
    Chat,
    /// Create an entry from text or dictation and wait for its title
    Submit {
        /// Read further text from stdin, one segment per line
        #[arg(long)]
        dictate: bool,
        /// Entry text
        words: Vec<String>,
    },
    /// Print the text found in an image
    Ocr {
        /// Image path
        path: PathBuf,
    },
    /// Follow an entry until it is enriched
    Watch {
        /// Entry to follow
        id: EntityId,
        /// Wait for the emotional landscape instead of the title
        #[arg(long)]
        insights: bool,
    },
}

/// Run the command-line client.
///
/// # Returns
/// `ExitCode::SUCCESS` on success, `2` on bad arguments, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    init_tracing();

    let command = match Cli::try_parse() {
        Ok(cli) => cli.command,
        Err(e) => {
            // Help and version requests are not failures.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = runtime.block_on(execute(command)) {
        tracing::error!("{e:#}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn execute(command: Command) -> anyhow::Result<()> {
    let config = ClientConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        "journal-sync v{} talking to {}",
        env!("CARGO_PKG_VERSION"),
        config.api.base_url
    );
    let client = JournalClient::new(config, std::env::var(ENV_TOKEN).ok())?;
    let mut out = tokio::io::stdout();

    match command {
        Command::Chat => chat(&client, &mut out).await,
        Command::Submit { dictate, words } => {
            submit(&client, &mut out, words.join(" "), dictate).await
        }
        Command::Ocr { path } => ocr(&client, &mut out, &path).await,
        Command::Watch { id, insights } => {
            let view = if insights {
                InsightsView::Insights
            } else {
                InsightsView::Result
            };
            watch(&client, &mut out, id, view).await
        }
    }
}

/// Writes each assistant reply incrementally as the log grows.
#[derive(Debug, Default)]
struct ReplyPrinter {
    current: Option<MessageId>,
    printed: usize,
}

impl ReplyPrinter {
    fn delta<'a>(&mut self, log: &'a MessageLog) -> Option<&'a str> {
        let message = log.last().filter(|m| m.role == Role::Assistant)?;
        if self.current != Some(message.id) {
            self.current = Some(message.id);
            self.printed = 0;
        }
        let delta = message.content.get(self.printed..)?;
        self.printed = message.content.len();
        Some(delta).filter(|d| !d.is_empty())
    }
}

async fn chat<W: AsyncWrite + Unpin>(client: &JournalClient, out: &mut W) -> anyhow::Result<()> {
    let controller = client.mind_search();
    controller.refresh_suggestions().await;
    for suggestion in controller.suggestions() {
        out.write_all(format!("? {suggestion}\n").as_bytes()).await?;
    }
    out.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut log = controller.reducer().subscribe();
    let mut printer = ReplyPrinter::default();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let send = controller.send(&line);
        tokio::pin!(send);
        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                changed = log.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let snapshot = log.borrow_and_update().clone();
                    if let Some(delta) = printer.delta(&snapshot) {
                        out.write_all(delta.as_bytes()).await?;
                        out.flush().await?;
                    }
                }
            }
        };
        let snapshot = controller.reducer().snapshot();
        if let Some(delta) = printer.delta(&snapshot) {
            out.write_all(delta.as_bytes()).await?;
        }
        out.write_all(b"\n").await?;
        out.flush().await?;
        if let Err(err) = result {
            tracing::warn!("{}", err.user_message());
        }
    }
    Ok(())
}

async fn submit<W: AsyncWrite + Unpin>(
    client: &JournalClient,
    out: &mut W,
    text: String,
    dictate: bool,
) -> anyhow::Result<()> {
    let mut composer = client.composer();
    composer.set_text(text);
    if dictate {
        composer = composer.with_recognizer(Arc::new(StdinRecognizer::new()));
        composer.toggle_dictation();
        while composer.next_dictation_event().await.is_some() && composer.is_listening() {}
    }

    let entry = composer.submit().await.context("entry was not created")?;
    out.write_all(format!("created {}\n", entry.id).as_bytes()).await?;
    out.flush().await?;

    let mut view = client.insights(InsightsView::Result);
    view.open(entry.id, entry.fields);
    if let Some(insights) = view.wait_ready().await {
        out.write_all(format!("title: {}\n", insights.display_title()).as_bytes())
            .await?;
    }
    out.flush().await?;
    Ok(())
}

async fn ocr<W: AsyncWrite + Unpin>(
    client: &JournalClient,
    out: &mut W,
    path: &Path,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("capture.png")
        .to_string();
    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    };

    let mut composer = client.composer();
    let text = composer
        .scan_image(&file_name, mime, bytes)
        .await
        .context("OCR failed")?;
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}

async fn watch<W: AsyncWrite + Unpin>(
    client: &JournalClient,
    out: &mut W,
    id: EntityId,
    view: InsightsView,
) -> anyhow::Result<()> {
    let mut controller = client.insights(view);
    controller
        .load(client.http.as_ref(), id.clone())
        .await
        .with_context(|| format!("cannot load entry {id}"))?;

    while !controller.is_ready() {
        if controller.next_update().await.is_none() {
            bail!("entry {id} stopped polling before {} was ready", view.field());
        }
        tracing::info!(entity_id = %id, "still waiting for {}", view.field());
    }
    let rendered = serde_json::to_string_pretty(controller.insights())?;
    out.write_all(rendered.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}
