use std::io::Write;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chartkeeper::app::App;
use chartkeeper::config::{ConfigLoader, ResolvedConfig};
use chartkeeper::domain::{DownloadJob, JobId};
use chartkeeper::error::ChartError;
use chartkeeper::fetch::HttpFetcher;
use chartkeeper::jobs::JobManager;
use chartkeeper::output::JsonOutput;
use chartkeeper::store::FlagStore;

#[derive(Parser)]
#[command(name = "chartkeeper")]
#[command(about = "Local map chart repository: discover charts, read tiles, download new charts")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Inspect and manage local charts")]
    Charts(ChartsArgs),
    #[command(about = "Download a chart or a zip of charts into the chart root")]
    Download(DownloadArgs),
}

#[derive(Args)]
struct ChartsArgs {
    #[command(subcommand)]
    command: ChartsCommand,
}

#[derive(Subcommand)]
enum ChartsCommand {
    #[command(about = "List discovered charts")]
    List(ListArgs),
    #[command(about = "Read one tile of a chart")]
    Tile(TileArgs),
    #[command(about = "Enable a chart by relative path or identifier")]
    Enable(FlagArgs),
    #[command(about = "Disable a chart by relative path or identifier")]
    Disable(FlagArgs),
}

#[derive(Args)]
struct ListArgs {
    /// Include disabled charts.
    #[arg(long)]
    all: bool,
}

#[derive(Args)]
struct TileArgs {
    identifier: String,
    z: u32,
    x: u32,
    y: u32,

    /// Write the tile here instead of stdout.
    #[arg(long)]
    out: Option<String>,
}

#[derive(Args)]
struct FlagArgs {
    chart: String,
}

#[derive(Args)]
struct DownloadArgs {
    url: String,

    /// File name for a single-file download.
    #[arg(long)]
    name: Option<String>,

    /// Folder below the chart root.
    #[arg(long)]
    dir: Option<String>,

    /// Print the queued job and exit without waiting.
    #[arg(long)]
    no_wait: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ChartError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ChartError) -> u8 {
    match error {
        ChartError::ChartNotFound(_) | ChartError::JobNotFound(_) => 2,
        ChartError::InvalidUrl(_) => 2,
        ChartError::Http(_)
        | ChartError::HttpStatus { .. }
        | ChartError::TooManyRedirects(_) => 3,
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
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    runtime.block_on(run_command(cli.command, resolved))
}

async fn run_command(command: Commands, resolved: ResolvedConfig) -> miette::Result<()> {
    let app = build_app(&resolved)?;
    app.rescan_charts().await?;
    let sweep = app.jobs().spawn_retention_sweep();
    let result = match command {
        Commands::Charts(args) => run_charts(args, &app),
        Commands::Download(args) => run_download(args, &app).await,
    };
    sweep.abort();
    result
}

fn build_app(resolved: &ResolvedConfig) -> Result<App<HttpFetcher>, ChartError> {
    let store = resolved.store();
    store.ensure_chart_root()?;
    let flags = FlagStore::load(store.flags_path())?;
    let fetcher = HttpFetcher::new(resolved.http_timeout, resolved.max_redirects)?;
    let jobs = JobManager::new(fetcher, resolved.jobs)?;
    Ok(App::new(store, flags, jobs))
}

fn run_charts(args: ChartsArgs, app: &App<HttpFetcher>) -> miette::Result<()> {
    match args.command {
        ChartsCommand::List(list) => {
            JsonOutput::print_charts(&app.list_charts(list.all)).into_diagnostic()?;
        }
        ChartsCommand::Tile(tile) => {
            if app.snapshot().get(&tile.identifier).is_none() {
                return Err(ChartError::ChartNotFound(tile.identifier).into());
            }
            let reply = app.tile(&tile.identifier, tile.z, tile.x, tile.y);
            match reply.status {
                200 => {}
                404 => {
                    return Err(ChartError::ChartNotFound(format!(
                        "{}/{}/{}/{}",
                        tile.identifier, tile.z, tile.x, tile.y
                    ))
                    .into());
                }
                _ => {
                    return Err(ChartError::Filesystem(format!(
                        "tile lookup failed for {}/{}/{}/{}",
                        tile.identifier, tile.z, tile.x, tile.y
                    ))
                    .into());
                }
            }
            match tile.out {
                Some(path) => std::fs::write(&path, &reply.body)
                    .map_err(|err| ChartError::WriteFailure(format!("{path}: {err}")))?,
                None => std::io::stdout()
                    .write_all(&reply.body)
                    .into_diagnostic()?,
            }
        }
        ChartsCommand::Enable(flag) => set_flag(app, &flag.chart, true)?,
        ChartsCommand::Disable(flag) => set_flag(app, &flag.chart, false)?,
    }
    Ok(())
}

fn set_flag(app: &App<HttpFetcher>, chart: &str, enabled: bool) -> Result<(), ChartError> {
    let snapshot = app.snapshot();
    let relative_path = snapshot
        .charts()
        .map(|descriptor| snapshot.relative_path(descriptor))
        .find(|path| path == chart)
        .or_else(|| {
            snapshot
                .get(chart)
                .map(|descriptor| snapshot.relative_path(descriptor))
        })
        .ok_or_else(|| ChartError::ChartNotFound(chart.to_string()))?;
    app.set_enabled(&relative_path, enabled)?;
    info!(chart = %relative_path, enabled, "chart flag updated");
    Ok(())
}

async fn run_download(args: DownloadArgs, app: &App<HttpFetcher>) -> miette::Result<()> {
    let id = app.submit_download(&args.url, args.name, args.dir.as_deref())?;
    if args.no_wait {
        JsonOutput::print_job(&app.job(id)?).into_diagnostic()?;
        return Ok(());
    }

    let job = tokio::select! {
        job = app.jobs().wait(id) => job?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job = %id, "interrupted, cancelling download");
            app.cancel_job(id).await?
        }
    };
    JsonOutput::print_job(&job).into_diagnostic()?;
    job_result(id, &job)
}

fn job_result(id: JobId, job: &DownloadJob) -> miette::Result<()> {
    match &job.error {
        None => Ok(()),
        Some(message) => Err(miette::miette!("download {id} failed: {message}")),
    }
}
