use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use client_core::{config::load_settings, projection::AnalysisStats, SessionController, SessionEvent};
use shared::protocol::Visualizations;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::broadcast,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "scavenger",
    about = "Upload a CSV dataset, detect outliers on the analysis service, and download the cleaned file"
)]
struct Args {
    /// Dataset to analyze.
    file: PathBuf,
    /// Analysis service root, e.g. http://127.0.0.1:8000.
    #[arg(long)]
    backend_url: Option<String>,
    /// Reconstruction-error percentile above which records count as outliers.
    #[arg(long)]
    threshold: Option<f64>,
    /// Remove outliers without asking.
    #[arg(long)]
    yes: bool,
    /// Where to write the cleaned dataset. Defaults to cleaned_<name> next to the input.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Decode the result charts into this directory as PNG files.
    #[arg(long)]
    visualizations_dir: Option<PathBuf>,
}

/// Prints notifications the session emitted since the last flush.
struct Notifier {
    rx: broadcast::Receiver<SessionEvent>,
}

impl Notifier {
    fn flush(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                SessionEvent::Succeeded { message, .. } => println!("✓ {message}"),
                SessionEvent::Failed { kind, message, .. } => eprintln!("✗ {message} ({kind})"),
                SessionEvent::PhaseChanged(phase) => tracing::debug!(%phase, "phase changed"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(url) = args.backend_url.clone() {
        settings.backend_url = url;
    }
    if let Some(threshold) = args.threshold {
        settings.threshold_percentile = threshold;
    }
    let threshold = settings.threshold()?;

    let controller = SessionController::from_settings(&settings)?;
    let mut notifier = Notifier {
        rx: controller.subscribe_events(),
    };
    info!(backend = %settings.backend_url, %threshold, "starting session");

    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read dataset '{}'", args.file.display()))?;
    let name = args
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("'{}' is not a file path", args.file.display()))?;

    let step = controller.select_file(bytes, name).await;
    notifier.flush();
    step?;

    let step = controller.upload().await;
    notifier.flush();
    step?;
    if let Some(summary) = controller.view().await.upload_summary {
        println!("{summary}");
    }

    let step = controller.detect_outliers(threshold.value()).await;
    notifier.flush();
    step?;

    let view = controller.view().await;
    if let Some(stats) = &view.stats {
        print_stats(stats);
    }
    if let (Some(dir), Some(charts)) = (&args.visualizations_dir, &view.visualizations) {
        let written = write_visualizations(dir, charts).await?;
        println!("Wrote {written} chart(s) to {}", dir.display());
    }

    let prompt = view
        .decision_prompt
        .clone()
        .unwrap_or_else(|| "Outliers detected".to_string());
    if !args.yes && !confirm(&format!("{prompt}. Remove them from your dataset?")).await? {
        controller.cancel_decision().await?;
        notifier.flush();
        println!("Outliers kept; nothing downloaded.");
        return Ok(());
    }

    controller.confirm_removal().await?;
    let step = controller.download_cleaned().await;
    notifier.flush();
    let cleaned = step?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.file, &cleaned.filename));
    tokio::fs::write(&output, &cleaned.bytes)
        .await
        .with_context(|| format!("failed to write cleaned dataset '{}'", output.display()))?;
    println!("Saved cleaned dataset to {}", output.display());
    Ok(())
}

fn print_stats(stats: &AnalysisStats) {
    println!("Total records:     {}", stats.total_records);
    println!(
        "Outliers detected: {} ({:.1}% of total)",
        stats.outliers_count, stats.outlier_percentage
    );
    println!(
        "Clean records:     {} ({:.1}% of total)",
        stats.cleaned_records, stats.cleaned_percentage
    );
}

async fn confirm(question: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{question} [y/N] ").as_bytes())
        .await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read confirmation")?;
    Ok(is_affirmative(&line))
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn default_output_path(input: &Path, cleaned_filename: &str) -> PathBuf {
    input.with_file_name(cleaned_filename)
}

/// Decodes each chart and writes it as `<name>.png`. Charts that are not
/// valid base64 are skipped.
async fn write_visualizations(dir: &Path, charts: &Visualizations) -> Result<usize> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create '{}'", dir.display()))?;
    let mut written = 0;
    for (name, payload) in [
        ("scatter_plot", &charts.scatter_plot),
        ("error_distribution", &charts.error_distribution),
        ("feature_distribution", &charts.feature_distribution),
    ] {
        let bytes = match STANDARD.decode(payload.trim()) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                warn!(chart = name, "chart payload is empty; skipping");
                continue;
            }
            Err(err) => {
                warn!(chart = name, error = %err, "chart payload is not valid base64; skipping");
                continue;
            }
        };
        let path = dir.join(format!("{name}.png"));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        written += 1;
    }
    Ok(written)
}
