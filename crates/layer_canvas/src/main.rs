mod logging;
mod replay;

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use engine::{CanvasEngine, EngineConfig, EvictionMode};
use replay_protocol::{read_jsonl_steps, validate_script};

#[derive(Parser)]
#[command(author, version, about = "Replay a layered canvas command script")]
struct Arguments {
    /// JSON-lines script of replay steps.
    script: PathBuf,
    /// Recompute layer evictions inline instead of on the worker thread.
    #[arg(long)]
    sync: bool,
    /// Abort on the first rejected command.
    #[arg(long)]
    strict: bool,
    /// Pretty-print the JSON report.
    #[arg(long)]
    pretty: bool,
    /// Enable debug logging (honours `RUST_LOG`).
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let arguments = Arguments::parse();
    logging::init(arguments.debug);

    let file = File::open(&arguments.script)
        .with_context(|| format!("open script {}", arguments.script.display()))?;
    let steps = read_jsonl_steps(&mut BufReader::new(file))
        .with_context(|| format!("read script {}", arguments.script.display()))?;
    validate_script(&steps)
        .map_err(|error| anyhow::anyhow!("invalid script: {error:?}"))?;

    let config = EngineConfig {
        eviction: if arguments.sync {
            EvictionMode::Synchronous
        } else {
            EvictionMode::Background
        },
        ..EngineConfig::default()
    };
    let mut engine = CanvasEngine::new(config);
    tracing::info!(
        steps = steps.len(),
        background_eviction = engine.has_background_worker(),
        "replaying script"
    );

    let report = replay::run_script(&mut engine, &steps, arguments.strict)?;
    if !report.failures.is_empty() {
        tracing::warn!(failures = report.failures.len(), "some commands were rejected");
    }

    let mut stdout = std::io::stdout().lock();
    if arguments.pretty {
        serde_json::to_writer_pretty(&mut stdout, &report).context("write report")?;
    } else {
        serde_json::to_writer(&mut stdout, &report).context("write report")?;
    }
    stdout.write_all(b"\n").context("write report")?;
    Ok(())
}
