use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use abi_connect::catalog::CatalogHttpClient;
use abi_connect::config::{ConfigLoader, ResolvedConfig};
use abi_connect::domain::ResolutionTier;
use abi_connect::download::{HttpFetcher, RetryingFetcher};
use abi_connect::error::AbiError;
use abi_connect::pipeline::Pipeline;
use abi_connect::registration::{AntsApplyTransforms, RegistrationAdapter};
use abi_connect::store::Store;

#[derive(Parser)]
#[command(name = "abi-connect")]
#[command(about = "Acquire, convert, and register Allen brain connectivity volumes")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    /// Root directory for sourcedata/procdata/bids trees.
    #[arg(long, global = true)]
    data_root: Option<String>,

    /// Source grid resolution in micrometers (100 or 25).
    #[arg(long, global = true, default_value = "100")]
    resolution: ResolutionTier,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Walk the catalog and download metadata and grid volumes")]
    Download(DownloadArgs),
    #[command(about = "Convert downloaded volumes and register them to reference space")]
    Process,
    #[command(about = "Lay registered volumes out as a bids-style tree")]
    Bids,
    #[command(about = "Partition the bids tree into buckets and archive each")]
    Archive,
    #[command(about = "Run download, process, bids, and archive in sequence")]
    All(DownloadArgs),
}

#[derive(Args, Clone)]
struct DownloadArgs {
    #[arg(long, default_value_t = 0)]
    start_row: u64,

    /// Stop after this many catalog rows instead of the server-reported total.
    #[arg(long)]
    total_rows: Option<u64>,

    #[arg(long)]
    page_size: Option<u64>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    backoff_secs: Option<u64>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(abi) = report.downcast_ref::<AbiError>() {
            return ExitCode::from(map_exit_code(abi));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AbiError) -> u8 {
    match error {
        AbiError::ConfigRead(_) | AbiError::ConfigParse(_) | AbiError::InvalidResolution(_) => 2,
        AbiError::CatalogHttp(_)
        | AbiError::CatalogStatus { .. }
        | AbiError::CatalogStalled { .. }
        | AbiError::DownloadHttp(_)
        | AbiError::DownloadStatus { .. }
        | AbiError::DownloadExhausted { .. }
        | AbiError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut resolved = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;
    if let Some(data_root) = cli.data_root {
        resolved.data_root = data_root.into();
    }

    match cli.command {
        Commands::Download(args) => {
            apply_overrides(&mut resolved, &args);
            let pipeline = build_pipeline(&resolved, cli.resolution)?;
            let report = pipeline
                .run_download(args.start_row, args.total_rows)
                .into_diagnostic()?;
            println!(
                "download: {} acquired, {} already present",
                report.completed, report.skipped
            );
        }
        Commands::Process => {
            let pipeline = build_pipeline(&resolved, cli.resolution)?;
            let report = pipeline.run_process().into_diagnostic()?;
            println!(
                "process: {} registered, {} already done",
                report.completed, report.skipped
            );
        }
        Commands::Bids => {
            let pipeline = build_pipeline(&resolved, cli.resolution)?;
            let report = pipeline.run_bids().into_diagnostic()?;
            println!(
                "bids: {} placed, {} skipped",
                report.completed, report.skipped
            );
        }
        Commands::Archive => {
            let pipeline = build_pipeline(&resolved, cli.resolution)?;
            let archives = pipeline.run_archive().into_diagnostic()?;
            for archive in &archives {
                println!("{archive}");
            }
        }
        Commands::All(args) => {
            apply_overrides(&mut resolved, &args);
            let pipeline = build_pipeline(&resolved, cli.resolution)?;
            pipeline
                .run_download(args.start_row, args.total_rows)
                .into_diagnostic()?;
            pipeline.run_process().into_diagnostic()?;
            pipeline.run_bids().into_diagnostic()?;
            let archives = pipeline.run_archive().into_diagnostic()?;
            println!("complete: {} archives written", archives.len());
        }
    }
    Ok(())
}

fn apply_overrides(resolved: &mut ResolvedConfig, args: &DownloadArgs) {
    if let Some(page_size) = args.page_size {
        resolved.page_size = page_size;
    }
    if let Some(max_retries) = args.max_retries {
        resolved.max_retries = max_retries;
    }
    if let Some(backoff_secs) = args.backoff_secs {
        resolved.backoff_secs = backoff_secs;
    }
}

fn build_pipeline(
    resolved: &ResolvedConfig,
    tier: ResolutionTier,
) -> miette::Result<Pipeline<CatalogHttpClient, RetryingFetcher<HttpFetcher>, AntsApplyTransforms>>
{
    let catalog = CatalogHttpClient::new(&resolved.api_base_url).into_diagnostic()?;
    let fetcher = RetryingFetcher::new(
        HttpFetcher::new().into_diagnostic()?,
        resolved.max_retries as usize,
        Duration::from_secs(resolved.backoff_secs),
    );
    let registrar = RegistrationAdapter::new(
        AntsApplyTransforms::new(),
        resolved.registration.clone(),
    );
    let store = Store::new(resolved.data_root.clone());

    Ok(Pipeline::new(
        catalog,
        fetcher,
        registrar,
        store,
        resolved.api_base_url.clone(),
        resolved.page_size,
        tier,
    ))
}
