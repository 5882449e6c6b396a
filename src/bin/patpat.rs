use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use patpat::app::{App, MapOptions};
use patpat::cache::{Confirm, ConfirmPolicy};
use patpat::catalog::OrganismKey;
use patpat::config::{ConfigLoader, Settings};
use patpat::domain::{Identifier, MapperKind, TaskId};
use patpat::error::PatpatError;
use patpat::mapper::{CancelToken, build_mappers};
use patpat::output::{
    ConsoleProgress, JsonOutput, OutputMode, print_map_summary, print_tasks_summary,
};
use patpat::prompt::TerminalConfirm;
use patpat::store::Store;
use patpat::uniprot::UniprotHttpClient;

#[derive(Parser)]
#[command(name = "patpat")]
#[command(about = "Find public proteomics datasets for a protein (PRIDE, iProX, MassIVE)")]
#[command(version, author)]
struct Cli {
    /// Runtime environment directory [default: ./patpat_env]
    #[arg(long, global = true)]
    root: Option<Utf8PathBuf>,

    /// Explicit patpat.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create the runtime environment directories")]
    Init,
    #[command(about = "Reference proteome catalog")]
    Catalog(CatalogArgs),
    #[command(about = "Resolve an identifier into a query configuration")]
    Resolve(ResolveArgs),
    #[command(about = "Probe dataset sources for reachability")]
    Check(CheckArgs),
    #[command(about = "Resolve an identifier and map it across dataset sources")]
    Map(MapArgs),
    #[command(about = "List known tasks")]
    Tasks,
    #[command(about = "Show the exported result of a task")]
    Show(ShowArgs),
}

#[derive(Args)]
struct CatalogArgs {
    #[command(subcommand)]
    command: CatalogCommand,
}

#[derive(Subcommand)]
enum CatalogCommand {
    #[command(about = "Download the current reference proteome index")]
    Refresh,
    #[command(about = "Look up an organism by taxonomy id, proteome accession or name")]
    Show { organism: String },
}

#[derive(Args, Clone)]
struct ConfirmArgs {
    /// Download missing proteomes without asking
    #[arg(long, conflicts_with = "no")]
    yes: bool,

    /// Never download missing proteomes
    #[arg(long)]
    no: bool,
}

#[derive(Args)]
struct ResolveArgs {
    identifier: String,

    #[arg(long)]
    task: Option<String>,

    #[command(flatten)]
    confirm: ConfirmArgs,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long = "mapper", value_enum)]
    mappers: Vec<MapperKind>,
}

#[derive(Args)]
struct MapArgs {
    identifier: String,

    /// Reuse a task id; earlier results of that task are kept
    #[arg(long)]
    task: Option<String>,

    #[arg(long = "mapper", value_enum)]
    mappers: Vec<MapperKind>,

    #[arg(long)]
    skip_check: bool,

    #[command(flatten)]
    confirm: ConfirmArgs,
}

#[derive(Args)]
struct ShowArgs {
    task: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PatpatError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PatpatError) -> u8 {
    match error {
        PatpatError::InvalidIdentifier(_)
        | PatpatError::InvalidProteomeAccession(_)
        | PatpatError::InvalidTaxonId(_)
        | PatpatError::InvalidTaskId(_)
        | PatpatError::UnknownIdentifier(_)
        | PatpatError::SequenceNotFound { .. }
        | PatpatError::UnknownMapper(_)
        | PatpatError::TaskNotFound(_) => 2,
        PatpatError::CatalogUnavailable(_)
        | PatpatError::DownloadError { .. }
        | PatpatError::HttpClient(_)
        | PatpatError::AllSourcesFailed { .. } => 3,
        PatpatError::Declined(_) => 4,
        PatpatError::Cancelled { .. } => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let store = match &cli.root {
        Some(root) => Store::new(root.clone()),
        None => Store::from_current_dir()?,
    };
    init_logging(&store);

    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let settings = ConfigLoader::resolve(cli.config.as_deref(), store.root().as_std_path())?;
    tracing::debug!(root = %store.root(), ?settings, "starting");

    match cli.command {
        Commands::Init => {
            let app = build_app(store, settings)?;
            let result = app.init(sink(output_mode))?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_init(&result).into_diagnostic()?,
                OutputMode::Interactive => println!("environment ready at {}", result.root),
            }
            Ok(())
        }
        Commands::Catalog(args) => {
            let app = build_app(store, settings)?;
            match args.command {
                CatalogCommand::Refresh => {
                    let result = app.refresh_catalog(sink(output_mode))?;
                    JsonOutput::print_catalog(&result).into_diagnostic()?;
                }
                CatalogCommand::Show { organism } => {
                    let key: OrganismKey = organism.parse()?;
                    let result = app.show_organism(&key, sink(output_mode))?;
                    JsonOutput::print_organism(&result).into_diagnostic()?;
                }
            }
            Ok(())
        }
        Commands::Resolve(args) => {
            let identifier: Identifier = args.identifier.parse()?;
            let task = parse_task(args.task.as_deref())?;
            let confirm = confirm_for(&args.confirm, &settings, output_mode);
            let app = build_app(store, settings)?;
            let config =
                app.resolve(&identifier, task, confirm.as_ref(), sink(output_mode))?;
            JsonOutput::print_config(&config).into_diagnostic()?;
            Ok(())
        }
        Commands::Check(args) => {
            let kinds = selected_mappers(&args.mappers, &settings);
            let mappers = build_mappers(&kinds, &settings)?;
            let app = build_app(store, settings)?;
            let result = app.check(&mappers, sink(output_mode));
            JsonOutput::print_check(&result).into_diagnostic()?;
            Ok(())
        }
        Commands::Map(args) => {
            let identifier: Identifier = args.identifier.parse()?;
            let task = parse_task(args.task.as_deref())?;
            let confirm = confirm_for(&args.confirm, &settings, output_mode);
            let kinds = selected_mappers(&args.mappers, &settings);
            let mappers = build_mappers(&kinds, &settings)?;
            let app = build_app(store, settings)?;
            let options = MapOptions {
                skip_check: args.skip_check,
            };
            let result = app
                .map(
                    &identifier,
                    task,
                    mappers,
                    confirm.as_ref(),
                    options,
                    sink(output_mode),
                )?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_map(&result).into_diagnostic()?,
                OutputMode::Interactive => print_map_summary(&result),
            }
            Ok(())
        }
        Commands::Tasks => {
            let app = build_app(store, settings)?;
            let result = app.tasks()?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_tasks(&result).into_diagnostic()?,
                OutputMode::Interactive => print_tasks_summary(&result),
            }
            Ok(())
        }
        Commands::Show(args) => {
            let task: TaskId = args.task.parse()?;
            let app = build_app(store, settings)?;
            let result = app.show(&task)?;
            JsonOutput::print_show(&result).into_diagnostic()?;
            Ok(())
        }
    }
}

/// Logs go to stderr and to `logs/patpat.log` under the environment root.
fn init_logging(store: &Store) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let logs_dir = store.logs_dir();
    let file = fs::create_dir_all(logs_dir.as_std_path()).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join("patpat.log").as_std_path())
    });
    let file_layer = file.ok().map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

fn build_app(store: Store, settings: Settings) -> miette::Result<App> {
    let uniprot = UniprotHttpClient::new()?;
    Ok(App::new(store, settings, Arc::new(uniprot)).with_cancel(interrupt_token()))
}

/// A token that Ctrl-C flips. Without a handler the default signal
/// behaviour stays in place.
fn interrupt_token() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, cancelling");
        handler_token.cancel();
    }) {
        tracing::warn!("could not install Ctrl-C handler: {err}");
    }
    token
}

fn sink(mode: OutputMode) -> &'static dyn patpat::app::ProgressSink {
    match mode {
        OutputMode::Interactive => &ConsoleProgress,
        OutputMode::NonInteractive => &JsonOutput,
    }
}

fn parse_task(task: Option<&str>) -> miette::Result<Option<TaskId>> {
    Ok(task.map(str::parse::<TaskId>).transpose()?)
}

fn selected_mappers(requested: &[MapperKind], settings: &Settings) -> Vec<MapperKind> {
    if requested.is_empty() {
        settings.mappers.clone()
    } else {
        requested.to_vec()
    }
}

/// `--yes`/`--no` win, then `auto_download` from the config. Without either,
/// interactive runs ask and non-interactive runs decline.
fn confirm_for(args: &ConfirmArgs, settings: &Settings, mode: OutputMode) -> Box<dyn Confirm> {
    if args.yes {
        return Box::new(ConfirmPolicy::Accept);
    }
    if args.no {
        return Box::new(ConfirmPolicy::Reject);
    }
    match (settings.auto_download, mode) {
        (Some(true), _) => Box::new(ConfirmPolicy::Accept),
        (Some(false), _) | (None, OutputMode::NonInteractive) => Box::new(ConfirmPolicy::Reject),
        (None, OutputMode::Interactive) => Box::new(TerminalConfirm),
    }
}
