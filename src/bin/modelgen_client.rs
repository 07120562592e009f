use clap::Parser;
use dotenvy::dotenv;
use modelgen_relay::config::{PipelineConfig, ProcessorMode};
use modelgen_relay::pipeline::{Pipeline, PipelineState, SelectedFile};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upload a photo, wait for the processor and collect the generated artifact.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Photo to upload
    file: PathBuf,

    /// Base URL of the upload receiver (overrides RECEIVER_URL)
    #[arg(long)]
    receiver_url: Option<String>,

    /// How to talk to the processor (overrides PROCESSOR_MODE)
    #[arg(long, value_enum)]
    mode: Option<ProcessorMode>,

    /// Processing endpoint, or submit endpoint in polling mode
    #[arg(long)]
    processor_url: Option<String>,

    /// Polling mode: status endpoint prefix
    #[arg(long)]
    status_url: Option<String>,

    /// Polling mode: result endpoint prefix
    #[arg(long)]
    result_url: Option<String>,

    /// Polling cadence in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Wait after the upload before the processor is called, in milliseconds
    #[arg(long, default_value_t = 5000)]
    settle_delay_ms: u64,

    /// Where a downloaded artifact is written
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
}

impl Args {
    fn into_config(self) -> (PipelineConfig, PathBuf, PathBuf) {
        let mut config = PipelineConfig::from_env();
        if let Some(url) = self.receiver_url {
            config.receiver_url = url;
        }
        if let Some(mode) = self.mode {
            config.processor_mode = mode;
        }
        config.processor_url = self.processor_url.or(config.processor_url);
        config.status_url = self.status_url.or(config.status_url);
        config.result_url = self.result_url.or(config.result_url);
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        config.settle_delay = Duration::from_millis(self.settle_delay_ms);
        (config, self.file, self.output_dir)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelgen_client=info,modelgen_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, file, output_dir) = Args::parse().into_config();
    info!(
        "⚙️  Receiver={}, Mode={:?}",
        config.receiver_url, config.processor_mode
    );

    let mut pipeline = Pipeline::from_config(config)?;
    let selected = SelectedFile::from_path(&file).await?;
    pipeline.select_file(Some(selected))?;

    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling...");
            cancel.cancel();
        }
    });

    let state = pipeline.run().await?.clone();
    match state {
        PipelineState::Success(view) => {
            if let Some(blob) = pipeline.artifact_blob() {
                let target = output_dir.join(&view.download_name);
                tokio::fs::write(&target, &blob.bytes).await?;
                info!(
                    "💾 Saved {} ({} bytes, {})",
                    target.display(),
                    blob.bytes.len(),
                    blob.content_type
                );
                pipeline.release_result();
            } else {
                info!("🔗 Artifact available at {}", view.location);
            }
            if let Some(viewer) = &view.viewer_url {
                info!("👀 View it at {}", viewer);
            }
            Ok(())
        }
        PipelineState::Failure(failure) => {
            error!("❌ {:?} failure during {}: {}", failure.kind, failure.stage, failure.message);
            if failure.can_retry() {
                info!("Run the command again to retry.");
            }
            std::process::exit(1);
        }
        PipelineState::Selecting {
            validation: Some(message),
            ..
        } => {
            error!("❌ {}", message);
            std::process::exit(1);
        }
        other => anyhow::bail!("Pipeline stopped in {}", other.stage()),
    }
}
