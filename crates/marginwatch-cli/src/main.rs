use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marginwatch_pipeline::{NoticePipeline, RunConfig, RunStatus};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marginwatch")]
#[command(about = "Exchange margin notice pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one crawl-filter-extract-persist pass.
    Run {
        /// Earliest notice date to process (YYYY-MM-DD).
        #[arg(long)]
        start_date: Option<String>,
        /// Directory for the incremental log and export bundle.
        #[arg(long)]
        output_dir: Option<std::path::PathBuf>,
        /// Relevance policy: broad or strict.
        #[arg(long)]
        policy: Option<String>,
        /// Optional YAML overrides file.
        #[arg(long)]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let Commands::Run {
        start_date,
        output_dir,
        policy,
        config,
    } = cli.command.unwrap_or(Commands::Run {
        start_date: None,
        output_dir: None,
        policy: None,
        config: None,
    });

    let mut run_config = RunConfig::from_env();
    if let Some(path) = config {
        run_config.load_overrides_file(&path)?;
    }
    if let Some(start) = start_date {
        run_config.start_date = chrono::NaiveDate::parse_from_str(&start, "%Y-%m-%d")
            .with_context(|| format!("parsing --start-date {start}"))?;
    }
    if let Some(dir) = output_dir {
        run_config.output_dir = dir;
    }
    if let Some(policy) = policy {
        run_config.policy_name = policy;
    }

    let factory = Box::<marginwatch_browser::HttpSessionFactory>::default();
    let parser = Box::new(marginwatch_extract::GeminiParser::from_env()?);
    let pipeline = NoticePipeline::new(run_config, factory, parser)?;

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; flushing and stopping before the next notice");
            cancel.cancel();
        }
    });

    let summary = pipeline.run_once().await;
    println!(
        "run {}: status={} pages={} notices={} filtered={} records={} batches={} log={}",
        summary.run_id,
        summary.status.as_str(),
        summary.pages_processed,
        summary.notices_processed,
        summary.notices_filtered,
        summary.records_saved,
        summary.batches_flushed,
        summary.incremental_log.display()
    );
    if let Some(archive) = &summary.archive {
        println!("archive: {}", archive.display());
    }
    if let Some(failure) = &summary.failure {
        eprintln!("failure: {failure}");
    }
    if summary.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
