//! Replays a recorded event stream through a chat session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing::{debug, info};

use chatty_stream::{
    ChatSession, ConversationsStore, CorrectionIntensity, FormatCorrectionConfig,
    InMemoryChatRepository, Lane, ScriptedTransport, StreamEvent, StreamSettings,
};

/// Play a JSON-lines file of stream events through the assembler.
#[derive(Parser, Debug)]
#[command(name = "chatty-stream-replay")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON-lines file, one stream event per line.
    events: PathBuf,

    /// Lane to replay into.
    #[arg(short, long, value_enum, default_value_t = LaneArg::Text)]
    lane: LaneArg,

    /// Prompt sent with the request (drives image retry limits).
    #[arg(short, long, default_value = "")]
    prompt: String,

    /// JSON file with `stream` and `correction` settings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the correction intensity.
    #[arg(long, value_enum)]
    intensity: Option<IntensityArg>,

    /// Print the saved message as JSON instead of plain text.
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LaneArg {
    Text,
    Image,
}

impl From<LaneArg> for Lane {
    fn from(lane: LaneArg) -> Self {
        match lane {
            LaneArg::Text => Lane::Text,
            LaneArg::Image => Lane::Image,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum IntensityArg {
    Light,
    Moderate,
    Aggressive,
}

impl From<IntensityArg> for CorrectionIntensity {
    fn from(intensity: IntensityArg) -> Self {
        match intensity {
            IntensityArg::Light => CorrectionIntensity::Light,
            IntensityArg::Moderate => CorrectionIntensity::Moderate,
            IntensityArg::Aggressive => CorrectionIntensity::Aggressive,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReplayConfig {
    stream: StreamSettings,
    correction: FormatCorrectionConfig,
}

fn load_config(path: Option<&Path>) -> Result<ReplayConfig> {
    let Some(path) = path else {
        return Ok(ReplayConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

fn load_events(path: &Path) -> Result<Vec<StreamEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read events {}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: StreamEvent = serde_json::from_str(line)
            .with_context(|| format!("Invalid event on line {}", index + 1))?;
        events.push(event);
    }
    if events.is_empty() {
        bail!("No events in {}", path.display());
    }
    Ok(events)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(intensity) = args.intensity {
        config.correction.correction_intensity = intensity.into();
    }

    let events = load_events(&args.events)?;
    info!(count = events.len(), path = %args.events.display(), "Loaded events");

    let lane = Lane::from(args.lane);
    let transport = ScriptedTransport::from_events(events);
    let repository = InMemoryChatRepository::new();
    let (session, mut lane_events) = ChatSession::new(
        config.stream,
        config.correction,
        Arc::new(transport.clone()),
        Arc::new(repository.clone()),
    );

    let message_id = session.send(lane, args.prompt).await;
    let status = session.controller(lane).join().await;
    info!(lane = ?lane, status = ?status, attempts = transport.open_count(), "Replay finished");

    let mut store = ConversationsStore::new();
    while let Ok(event) = lane_events.try_recv() {
        debug!(event = ?event, "Lane event");
        store.apply(event);
    }
    for (_, notice) in store.notices() {
        eprintln!("notice: {}", notice);
    }

    if args.json {
        let saves = repository.saves_for(lane)?;
        match saves.last() {
            Some(record) => println!("{}", record.json),
            None => println!("null"),
        }
        return Ok(());
    }

    let Some(message) = store.get_message(lane, &message_id) else {
        println!("(message removed)");
        return Ok(());
    };
    if !message.reasoning.is_empty() {
        println!("--- reasoning ---\n{}\n", message.reasoning);
    }
    println!("--- answer ---\n{}", message.text);
    for url in &message.image_urls {
        println!("image: {}", url);
    }
    Ok(())
}
