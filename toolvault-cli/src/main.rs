//! Toolvault CLI - Run tool scripts in the sandbox from the command line

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use toolvault_core::prelude::*;

#[derive(Parser)]
#[command(name = "toolvault")]
#[command(about = "Toolvault sandboxed tool runner", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tool script once and print the execution result as JSON
    Run {
        /// Path to the script defining `invoke(params)`
        script: PathBuf,

        /// Parameters passed to `invoke`, as JSON
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Ambient context exposed as `context`, as JSON object
        #[arg(short, long, default_value = "{}")]
        context: String,

        /// Override the computation budget
        #[arg(long, env = "TOOLVAULT_TIMEOUT_MS")]
        timeout_ms: Option<u64>,

        /// Configuration file (defaults to toolvault.toml and TOOLVAULT_* vars)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Tool name used in provenance and the LLM feature tag
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Version information
    Version,
}

/// Language model for offline runs: truncation works, generation does not
struct OfflineModel {
    tokenizer: WhitespaceTokenizer,
}

#[async_trait]
impl LanguageModel for OfflineModel {
    async fn generate(
        &self,
        _prompt: &Prompt,
        _identity: &ActingIdentity,
        feature_name: &str,
    ) -> toolvault_core::error::Result<String> {
        Err(ToolvaultError::Host(format!(
            "no language model configured for {feature_name}"
        )))
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("toolvault {}", env!("CARGO_PKG_VERSION"));
            println!("toolvault-core {}", toolvault_core::VERSION);
        }
        Commands::Run {
            script,
            params,
            context,
            timeout_ms,
            config,
            name,
        } => {
            let config = match config {
                Some(path) => SandboxConfig::from_file(&path)?,
                None => SandboxConfig::load()?,
            };

            let source = std::fs::read_to_string(&script)
                .with_context(|| format!("failed to read {}", script.display()))?;
            let parameters: serde_json::Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;
            let context: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&context).context("--context must be a JSON object")?;

            let name = name.unwrap_or_else(|| {
                script
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "script".to_string())
            });
            tracing::info!(
                script = %script.display(),
                tool = %name,
                timeout_ms = timeout_ms.unwrap_or(config.timeout_ms),
                "running tool script"
            );
            let tool = ToolDefinition::new(name.clone(), name, source);

            let mut builder = ToolRunner::builder(
                tool,
                Arc::new(OfflineModel {
                    tokenizer: WhitespaceTokenizer,
                }),
                ActingIdentity::new(-1, "system"),
            )
            .parameters(parameters)
            .context(context)
            .http(Arc::new(ReqwestTransport::new(config.http_timeout)?))
            .config(config);

            if let Some(timeout_ms) = timeout_ms {
                builder = builder.timeout(Duration::from_millis(timeout_ms));
            }

            let result = builder.build().invoke().await;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if let Some(error) = result.error() {
                tracing::info!(
                    session_id = %result.provenance.session_id,
                    kind = error.kind(),
                    "tool script failed"
                );
                anyhow::bail!("tool failed ({}): {}", error.kind(), error);
            }

            tracing::info!(
                session_id = %result.provenance.session_id,
                http_requests = result.provenance.http_requests,
                "tool script succeeded"
            );
        }
    }

    Ok(())
}
