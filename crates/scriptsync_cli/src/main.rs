//! Command-line client for the ScriptSync document server.
//!
//! Every command runs a short-lived sync session: edits go through the same
//! patch queue an editor would use, so conflicts and rate limits are handled
//! the same way.

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use scriptsync_core::constants::DEFAULT_SERVER_URL;
use scriptsync_core::models::DocumentSummary;
use scriptsync_core::prefs::{FilePrefs, PrefsStore};
use scriptsync_core::{
    Content, Document, DocumentId, DocumentPatch, DocumentStore, FlushOutcome, FailureKind,
    HttpStore, PatchReason, Session, SyncConfig, Visibility,
};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Flush attempts before an edit is reported as unsaved.
const MAX_FLUSH_ATTEMPTS: usize = 8;
/// Pause while another flush of the same document finishes.
const IN_FLIGHT_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "ssync", about = "ScriptSync CLI", version)]
struct Cli {
    /// Server URL (can also be set via SCRIPTSYNC_SERVER env var)
    #[arg(short, long, env = "SCRIPTSYNC_SERVER")]
    server: Option<String>,

    /// Bearer token (can also be set via API_TOKEN env var)
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    json: bool,

    /// Print timing for commands
    #[arg(long, global = true)]
    timing: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
    /// List documents, newest first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only titles containing this text (case-insensitive)
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Print a document; defaults to the last one opened
    Get { id: Option<String> },
    /// Create a document from a file or stdin
    New {
        #[arg(short, long)]
        file: Option<String>,
        #[arg(short, long)]
        title: Option<String>,
        #[arg(long)]
        public: bool,
    },
    /// Replace a document's content from a file or stdin
    Edit {
        id: String,
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Rename a document
    SetTitle { id: String, title: String },
    Delete { id: String },
}

fn log_timing(timing: bool, label: &str, duration: Duration) {
    if timing {
        eprintln!(
            "[timing] {}: {:.1} ms",
            label,
            duration.as_secs_f64() * 1000.0
        );
    }
}

fn normalize_server(server: String) -> String {
    if let Ok(mut url) = reqwest::Url::parse(&server) {
        let should_normalize_localhost =
            url.scheme().eq_ignore_ascii_case("http") && url.host_str() == Some("localhost");
        if should_normalize_localhost && url.set_host(Some("127.0.0.1")).is_err() {
            return server;
        }
        let mut normalized = url.to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }
        return normalized;
    }
    server
}

fn explicit_override(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn resolve_server(server: Option<String>) -> String {
    normalize_server(explicit_override(server).unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()))
}

fn read_content(file: Option<&str>) -> anyhow::Result<String> {
    match file {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))
        }
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        }
    }
}

fn filter_summaries(
    summaries: Vec<DocumentSummary>,
    filter: Option<&str>,
    limit: usize,
) -> Vec<DocumentSummary> {
    let needle = filter.map(str::to_lowercase).unwrap_or_default();
    summaries
        .into_iter()
        .filter(|summary| summary.title.to_lowercase().contains(&needle))
        .take(limit)
        .collect()
}

fn format_summary_output(summaries: &[DocumentSummary], json: bool) -> anyhow::Result<String> {
    if json {
        return serde_json::to_string_pretty(summaries).context("response encoding error");
    }
    Ok(summaries
        .iter()
        .map(|summary| {
            format!(
                "{:<36} v{:<5} {:<8} {}",
                summary.id,
                summary.version,
                summary.visibility.as_str(),
                summary.title
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn format_get_output(document: &Document, json: bool) -> anyhow::Result<String> {
    if json {
        return serde_json::to_string_pretty(document).context("response encoding error");
    }
    Ok(document.content.plain_text())
}

fn format_saved_output(action: &str, document: &Document, json: bool) -> anyhow::Result<String> {
    if json {
        return serde_json::to_string_pretty(document).context("response encoding error");
    }
    Ok(format!(
        "{}: {} ({}, version {})",
        action, document.title, document.id, document.version
    ))
}

/// Flush `id` until the store has the edit or the failure is final.
///
/// Conflicts are resolved by the session itself (refresh, then replay), so a
/// conflict here only means waiting for that replay to land.
async fn flush_until_saved(session: &Session, id: &DocumentId) -> anyhow::Result<Document> {
    for attempt in 1..=MAX_FLUSH_ATTEMPTS {
        match session.flush(id).await {
            FlushOutcome::Saved(document) => return Ok(document),
            FlushOutcome::Idle | FlushOutcome::Moot => {
                if session.queue().is_flushing(id) {
                    tokio::time::sleep(IN_FLIGHT_POLL).await;
                    continue;
                }
                return session
                    .cache()
                    .get(id)
                    .context("document disappeared from the session");
            }
            FlushOutcome::AlreadyFlushing => tokio::time::sleep(IN_FLIGHT_POLL).await,
            FlushOutcome::Failed(err) => {
                let delay = match err.kind() {
                    FailureKind::Conflict => IN_FLIGHT_POLL,
                    FailureKind::RateLimited | FailureKind::Transient => {
                        session.queue().retry_delay(id)
                    }
                    FailureKind::InvalidResponse | FailureKind::Unauthorized => {
                        bail!("save failed: {}", err)
                    }
                };
                tracing::warn!(attempt, "save failed ({}); retrying in {:?}", err, delay);
                tokio::time::sleep(delay).await;
            }
            FlushOutcome::Unauthorized => bail!("server rejected the API token"),
            FlushOutcome::Invalid(err) => bail!("edit rejected: {}", err),
        }
    }
    bail!(
        "gave up after {} attempts; the edit was not saved",
        MAX_FLUSH_ATTEMPTS
    )
}

async fn load_document(session: &Session, id: &DocumentId) -> anyhow::Result<Document> {
    let document = session
        .refresh_document(id)
        .await
        .with_context(|| format!("failed to load document {}", id))?;
    session.select(Some(id))?;
    Ok(document)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scriptsync=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let Cli {
        server,
        token,
        json,
        timing,
        command,
    } = Cli::parse();

    if let Commands::Completions { shell } = &command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(*shell, &mut cmd, name, &mut io::stdout());
        return Ok(());
    }

    let mut config = SyncConfig::from_env();
    config.server_url = resolve_server(server);
    config.api_token = explicit_override(token);

    let store = HttpStore::from_config(&config)?;
    let prefs = FilePrefs::new(&config.prefs_path);
    let session = Session::new(
        Arc::new(store) as Arc<dyn DocumentStore>,
        Arc::new(prefs) as Arc<dyn PrefsStore>,
        &config,
    )?;

    let started = Instant::now();
    let label = match command {
        Commands::Completions { .. } => unreachable!("completions handled before session setup"),
        Commands::List { limit, filter } => {
            session.start().await?;
            let summaries = filter_summaries(session.cache().summaries(), filter.as_deref(), limit);
            let output = format_summary_output(&summaries, json)?;
            if !output.is_empty() {
                println!("{}", output);
            }
            "list"
        }
        Commands::Get { id } => {
            let id = match explicit_override(id) {
                Some(id) => DocumentId::from(id),
                None => session
                    .last_document()
                    .context("no document id given and none opened before")?,
            };
            let document = load_document(&session, &id).await?;
            println!("{}", format_get_output(&document, json)?);
            "get"
        }
        Commands::New {
            file,
            title,
            public,
        } => {
            let content = read_content(file.as_deref())?;
            let visibility = if public {
                Visibility::Public
            } else {
                Visibility::Private
            };
            let document = session
                .create(explicit_override(title), Content::text(content), visibility)
                .await?;
            println!("{}", format_saved_output("Created", &document, json)?);
            "new"
        }
        Commands::Edit { id, file } => {
            let id = DocumentId::from(id);
            let content = read_content(file.as_deref())?;
            load_document(&session, &id).await?;
            let queued = session.edit(
                &id,
                DocumentPatch::default().with_content(Content::text(content)),
                PatchReason::Typing,
            )?;
            let document = if queued {
                flush_until_saved(&session, &id).await?
            } else {
                session.cache().get(&id).context("document not loaded")?
            };
            println!("{}", format_saved_output("Saved", &document, json)?);
            "edit"
        }
        Commands::SetTitle { id, title } => {
            let id = DocumentId::from(id);
            load_document(&session, &id).await?;
            session.edit(
                &id,
                DocumentPatch::default().with_title(title),
                PatchReason::Metadata,
            )?;
            let document = flush_until_saved(&session, &id).await?;
            println!("{}", format_saved_output("Renamed", &document, json)?);
            "set-title"
        }
        Commands::Delete { id } => {
            let id = DocumentId::from(id);
            session.delete(&id).await?;
            if json {
                println!("{}", serde_json::json!({ "success": true, "id": id }));
            } else {
                println!("Deleted document: {}", id);
            }
            "delete"
        }
    };
    log_timing(timing, label, started.elapsed());

    session.shutdown().await;
    Ok(())
}
