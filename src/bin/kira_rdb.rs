use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8Path;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_repeatsdb::config::{ConfigLoader, PipelineConfig, parse_regions};
use kira_repeatsdb::error::KiraError;
use kira_repeatsdb::output::{JsonOutput, LogSink, OutputMode};
use kira_repeatsdb::page::SnapshotProvider;
use kira_repeatsdb::pipeline::{Pipeline, RegionState, RunSummary};
use kira_repeatsdb::rcsb::RcsbHttpClient;
use kira_repeatsdb::repeatsdb::RepeatsDbHttpClient;
use kira_repeatsdb::store::PathTemplates;
use kira_repeatsdb::uniprot::UniprotHttpClient;

const EXIT_REGION_ERRORED: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "kira-rdb")]
#[command(about = "Harvest RepeatsDB annotations, repeat-unit alignments and chain sequences")]
#[command(version, author)]
#[command(after_help = "Ctrl-C stops handing out new fetches; in-flight ones finish before exit.")]
struct Cli {
    /// Region classes to process, e.g. `3.1,4.4`.
    #[arg(long, value_delimiter = ',')]
    regions: Option<Vec<String>>,

    #[arg(long)]
    no_sequences: bool,

    #[arg(long)]
    no_alignments: bool,

    /// Reuse existing annotation tables and fetch alignments only.
    #[arg(long)]
    alignments_only: bool,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    annotations_dir: Option<String>,

    #[arg(long)]
    alignments_dir: Option<String>,

    #[arg(long)]
    sequences_dir: Option<String>,

    /// Directory of rendered listing pages, `{dir}/{region}/page_{n}.html`.
    #[arg(long, default_value = "pages")]
    pages_dir: String,

    #[arg(long)]
    max_pages: Option<usize>,

    /// Per-item fetch timeout; 0 disables it.
    #[arg(long)]
    item_timeout_secs: Option<u64>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    non_interactive: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(summary) if summary.errored() > 0 => ExitCode::from(EXIT_REGION_ERRORED),
        Ok(summary) if summary.unfinished() > 0 => ExitCode::from(EXIT_INTERRUPTED),
        Ok(_) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(kira) = report.downcast_ref::<KiraError>() {
                return ExitCode::from(map_exit_code(kira));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::ConfigRead(_) | KiraError::AnnotationsNotFound(_) => 2,
        KiraError::RcsbHttp(_)
        | KiraError::RcsbStatus { .. }
        | KiraError::UniprotHttp(_)
        | KiraError::UniprotStatus { .. }
        | KiraError::RepeatsDbHttp(_)
        | KiraError::RepeatsDbStatus { .. }
        | KiraError::HarvestUnreachable { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<RunSummary> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli)?;

    let pipeline = Pipeline::new(
        SnapshotProvider::new(cli.pages_dir.as_str()),
        RepeatsDbHttpClient::new()?,
        RcsbHttpClient::new()?,
        UniprotHttpClient::new()?,
    );
    let cancel = pipeline.cancel_token().clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received; finishing in-flight fetches");
        cancel.cancel();
    })
    .into_diagnostic()?;

    let summary = match output_mode {
        OutputMode::NonInteractive => {
            let summary = pipeline.run(&config, &JsonOutput);
            JsonOutput::print_summary(&summary).into_diagnostic()?;
            summary
        }
        OutputMode::Interactive => {
            let summary = pipeline.run(&config, &LogSink);
            print_run_summary(&summary);
            summary
        }
    };
    Ok(summary)
}

/// Command-line flags win over the config file.
fn apply_overrides(config: &mut PipelineConfig, cli: &Cli) -> Result<(), KiraError> {
    if let Some(regions) = &cli.regions {
        config.regions = parse_regions(regions)?;
    }
    if cli.no_sequences {
        config.save_sequences = false;
    }
    if cli.no_alignments {
        config.save_alignments = false;
    }
    if cli.alignments_only {
        config.alignments_only = true;
    }
    if let Some(workers) = cli.workers {
        if workers == 0 {
            return Err(KiraError::InvalidConfig(
                "--workers must be at least 1".to_string(),
            ));
        }
        config.workers = workers;
    }
    if let Some(max_pages) = cli.max_pages {
        config.max_pages = Some(max_pages);
    }
    if let Some(secs) = cli.item_timeout_secs {
        config.item_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if cli.annotations_dir.is_some() || cli.alignments_dir.is_some() || cli.sequences_dir.is_some()
    {
        let parent = |template: &str| {
            Utf8Path::new(template)
                .parent()
                .map(|dir| dir.to_string())
                .unwrap_or_default()
        };
        let annotations = cli
            .annotations_dir
            .clone()
            .unwrap_or_else(|| parent(&config.paths.annotations));
        let alignments = cli
            .alignments_dir
            .clone()
            .unwrap_or_else(|| parent(&config.paths.alignments));
        let sequences = cli
            .sequences_dir
            .clone()
            .unwrap_or_else(|| parent(&config.paths.sequences));
        config.paths = PathTemplates::with_dirs(&annotations, &alignments, &sequences);
        config.paths.validate()?;
    }
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let done = summary
        .regions
        .iter()
        .filter(|region| region.state == RegionState::Done)
        .count();
    println!("{cyan}KIRA-RDB summary{reset}");
    println!("{green}Regions done: {done}{reset}");
    let errored = summary.errored();
    if errored > 0 {
        println!("{red}Regions errored: {errored}{reset}");
    }
    let unfinished = summary.unfinished();
    if unfinished > 0 {
        println!("{yellow}Regions unfinished: {unfinished}{reset}");
    }

    for region in &summary.regions {
        let color = match region.state {
            RegionState::Done => green,
            RegionState::Errored => red,
            _ => yellow,
        };
        println!(
            "{color}* {} {}{} ({} records, {} new rows, {} pages, {} failed pages){reset}",
            region.region,
            region.state.as_str(),
            if region.interrupted { " (interrupted)" } else { "" },
            region.records,
            region.annotations_appended,
            region.pages_read,
            region.pages_failed
        );
        if let Some(stage) = &region.alignments {
            println!(
                "{color}   alignments: {} written, {} skipped, {} failed, {} cancelled{reset}",
                stage.written, stage.skipped, stage.failed, stage.cancelled
            );
        }
        if let Some(stage) = &region.sequences {
            println!(
                "{color}   sequences: {} written, {} skipped, {} failed, {} cancelled{reset}",
                stage.written, stage.skipped, stage.failed, stage.cancelled
            );
        }
        if let (Some(stage), Some(error)) = (region.failed_in, &region.error) {
            println!("{red}   failed while {}: {error}{reset}", stage.as_str());
        }
    }
}
