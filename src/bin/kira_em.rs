use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_expression_matrix::app::{App, CellResult};
use kira_expression_matrix::config::{ConfigLoader, ResolvedConfig};
use kira_expression_matrix::domain::{CellRef, SimilarityMetric};
use kira_expression_matrix::error::KiraError;
use kira_expression_matrix::lsh::LshOptions;
use kira_expression_matrix::output::{JsonOutput, LogOutput};
use kira_expression_matrix::similarity::{CancelToken, SimilarityOptions};

#[derive(Parser)]
#[command(name = "kira-em")]
#[command(about = "On-disk single-cell expression matrix with exhaustive cell similarity search")]
#[command(version, author)]
struct Cli {
    /// Storage directory (overrides storage_dir from the config file).
    #[arg(long, global = true)]
    dir: Option<String>,

    /// Config file (default: kira-em.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Ingest expression counts and cell metadata")]
    AddCells(AddCellsArgs),
    #[command(about = "Score all cell pairs and store them under a name")]
    FindSimilarPairs(FindArgs),
    #[command(about = "Find similar cell pairs approximately with LSH signatures")]
    FindSimilarPairsLsh(FindLshArgs),
    #[command(about = "Write exact and LSH-estimated similarity for every cell pair as CSV")]
    CompareLsh(CompareLshArgs),
    #[command(about = "Remove a stored similar-pairs set")]
    RemoveSimilarPairs(NameArgs),
    #[command(about = "Write a similar-pairs set as CSV")]
    ExportSimilarPairs(ExportArgs),
    #[command(about = "Create a gene set from a gene name pattern")]
    CreateGeneSet(GeneSetArgs),
    #[command(about = "Create a cell set from a metadata pattern")]
    CreateCellSet(CellSetArgs),
    #[command(about = "Show one cell by id or name")]
    Cell(CellArgs),
    #[command(about = "Summarize the store")]
    Info,
}

#[derive(Args)]
struct AddCellsArgs {
    counts: PathBuf,
    metadata: PathBuf,
}

#[derive(Args)]
struct FindArgs {
    name: String,

    #[arg(long)]
    metric: Option<SimilarityMetric>,

    #[arg(long)]
    gene_set: Option<String>,

    #[arg(long)]
    cell_set: Option<String>,

    #[arg(long)]
    threshold: Option<f64>,

    #[arg(long)]
    max_pairs_per_cell: Option<usize>,

    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Args)]
struct LshArgs {
    #[arg(long)]
    bands: Option<usize>,

    #[arg(long)]
    rows: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct FindLshArgs {
    #[command(flatten)]
    find: FindArgs,

    #[command(flatten)]
    lsh: LshArgs,
}

#[derive(Args)]
struct CompareLshArgs {
    output: String,

    #[arg(long)]
    metric: Option<SimilarityMetric>,

    #[arg(long)]
    gene_set: Option<String>,

    #[arg(long)]
    cell_set: Option<String>,

    #[command(flatten)]
    lsh: LshArgs,
}

#[derive(Args)]
struct NameArgs {
    name: String,
}

#[derive(Args)]
struct ExportArgs {
    name: String,
    output: String,
}

#[derive(Args)]
struct GeneSetArgs {
    name: String,
    pattern: String,
}

#[derive(Args)]
struct CellSetArgs {
    name: String,
    key: String,
    pattern: String,
}

#[derive(Args)]
struct CellArgs {
    cell: String,

    /// List the cell's partners in this similar-pairs set.
    #[arg(long)]
    similar_pairs: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::CellNotFound(_)
        | KiraError::GeneSetNotFound(_)
        | KiraError::CellSetNotFound(_)
        | KiraError::SimilarPairsNotFound(_)
        | KiraError::EmptyInput(_) => 2,
        KiraError::SimilarPairsExists(_)
        | KiraError::SetExists(_)
        | KiraError::StoreNotEmpty(_)
        | KiraError::StoreLocked(_) => 3,
        KiraError::Parse { .. }
        | KiraError::FileRead(_)
        | KiraError::DataIntegrity(_)
        | KiraError::IncompatibleStore(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let dir = cli
        .dir
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| config.storage_dir.clone());

    let mut app = App::open(dir)?;
    match cli.command {
        Command::AddCells(args) => {
            let result = app.add_cells(&args.counts, &args.metadata, &LogOutput)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::FindSimilarPairs(args) => {
            let name = args.name.clone();
            let options = similarity_options(&config, args);
            let result =
                app.find_similar_pairs0(&name, &options, &CancelToken::new(), &LogOutput)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::FindSimilarPairsLsh(args) => {
            let name = args.find.name.clone();
            let lsh = lsh_options(&config, &args.lsh);
            let options = similarity_options(&config, args.find);
            let result = app.find_similar_pairs_lsh(
                &name,
                &options,
                &lsh,
                &CancelToken::new(),
                &LogOutput,
            )?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::CompareLsh(args) => {
            let lsh = lsh_options(&config, &args.lsh);
            let defaults = config.similarity.clone();
            let options = SimilarityOptions {
                metric: args.metric.unwrap_or(defaults.metric),
                gene_set: args.gene_set.unwrap_or(defaults.gene_set),
                cell_set: args.cell_set.unwrap_or(defaults.cell_set),
                ..defaults
            };
            let output = Utf8PathBuf::from(args.output);
            let result = app.write_lsh_comparison_csv(&options, &lsh, &output, &LogOutput)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::RemoveSimilarPairs(args) => {
            let result = app.remove_similar_pairs(&args.name, &LogOutput)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::ExportSimilarPairs(args) => {
            let output = Utf8PathBuf::from(args.output);
            let result = app.write_similar_pairs_csv(&args.name, &output, &LogOutput)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::CreateGeneSet(args) => {
            let result = app.create_gene_set(&args.name, &args.pattern, &LogOutput)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::CreateCellSet(args) => {
            let result =
                app.create_cell_set(&args.name, &args.key, &args.pattern, &LogOutput)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::Cell(args) => {
            let cell = args.cell.parse::<CellRef>()?;
            let neighbors = match &args.similar_pairs {
                Some(name) => Some(app.neighbors(name, &cell)?),
                None => None,
            };
            let result = CellResult {
                cell: app.cell(&cell)?,
                neighbors,
            };
            JsonOutput::print(&result).into_diagnostic()
        }
        Command::Info => {
            let result = app.info()?;
            JsonOutput::print(&result).into_diagnostic()
        }
    }
}

fn similarity_options(config: &ResolvedConfig, args: FindArgs) -> SimilarityOptions {
    let defaults = config.similarity.clone();
    SimilarityOptions {
        metric: args.metric.unwrap_or(defaults.metric),
        gene_set: args.gene_set.unwrap_or(defaults.gene_set),
        cell_set: args.cell_set.unwrap_or(defaults.cell_set),
        threshold: args.threshold.or(defaults.threshold),
        max_pairs_per_cell: args.max_pairs_per_cell.or(defaults.max_pairs_per_cell),
        threads: args.threads.or(defaults.threads),
    }
}

fn lsh_options(config: &ResolvedConfig, args: &LshArgs) -> LshOptions {
    LshOptions {
        band_count: args.bands.unwrap_or(config.lsh.band_count),
        row_count: args.rows.unwrap_or(config.lsh.row_count),
        seed: args.seed.unwrap_or(config.lsh.seed),
    }
}
