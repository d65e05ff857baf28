//! Run one widget-generation turn from the command line.
//!
//! Reads the raw schema and widget snapshot from JSON files, runs the
//! orchestrator against the configured completion service, and prints
//! the merged response (plus progress events with --stream).

use anyhow::Result;
use chartsmith::config::Settings;
use chartsmith::llm::OpenAiClient;
use chartsmith::model::{RawSchema, WidgetSnapshot};
use chartsmith::orchestrator::{ChatRequest, Orchestrator};
use chartsmith::schema_cache::SqliteAnalysisStore;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Run one widget-generation turn against the completion service")]
struct Args {
    /// The natural-language request
    message: String,

    /// Path to a raw schema JSON file
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// Path to a widget snapshot JSON file
    #[arg(short, long)]
    widget: Option<PathBuf>,

    /// Data-source identity, enables schema-analysis caching
    #[arg(short, long)]
    data_source: Option<String>,

    /// SQLite file backing the schema-analysis cache
    #[arg(long, default_value = "chartsmith_cache.db")]
    cache_db: PathBuf,

    /// Print progress events as JSON lines while running
    #[arg(long)]
    stream: bool,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let settings = Settings::from_env();
    let llm = Arc::new(OpenAiClient::new(&settings)?);
    let store = Arc::new(SqliteAnalysisStore::open(&args.cache_db)?);
    let orchestrator = Orchestrator::new(llm, settings).with_analysis_store(store);

    let schema: Option<RawSchema> = args.schema.as_deref().map(read_json).transpose()?;
    let widget: Option<WidgetSnapshot> = args.widget.as_deref().map(read_json).transpose()?;

    let request = ChatRequest {
        user_message: args.message,
        chat_history: Vec::new(),
        schema,
        widget,
        data_source_id: args.data_source,
    };

    let response = if args.stream {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                println!("{}", serde_json::to_string(&event).unwrap_or_default());
            }
        });
        let response = orchestrator.chat_stream(request, tx).await?;
        printer.await?;
        response
    } else {
        orchestrator.chat(request).await?
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
