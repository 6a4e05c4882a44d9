use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jailrun::{EngineConfig, SandboxConfig, SandboxedRunner, Substitutions};

const USAGE: &str = "usage: jailrun <config.json|config.toml|->";

/// Read the invocation config from a file, or stdin for `-`
fn load_invocation(arg: &str) -> Result<SandboxConfig> {
    let content = if arg == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read invocation config from stdin")?;
        buf
    } else {
        std::fs::read_to_string(arg).with_context(|| format!("Failed to read {}", arg))?
    };

    let is_toml = Path::new(arg)
        .extension()
        .is_some_and(|ext| ext == "toml");
    if is_toml {
        toml::from_str(&content).with_context(|| format!("Invalid invocation config {}", arg))
    } else {
        serde_json::from_str(&content).with_context(|| format!("Invalid invocation config {}", arg))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("jailrun=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let arg = std::env::args().nth(1).context(USAGE)?;
    let engine = EngineConfig::load()?;
    let config = load_invocation(&arg)?;
    info!("Loaded invocation config from {}", arg);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting run");
            on_interrupt.cancel();
        }
    });

    let runner = SandboxedRunner::new(engine);
    let report = runner.run(&config, &Substitutions::from_env(), cancel).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );
    Ok(())
}
