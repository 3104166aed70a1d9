use std::collections::BTreeSet;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use steamset_adapters::{CatalogApi, RateLimitedClient};
use steamset_core::{CatalogId, ValidationScope};
use steamset_harvest::{
    import_corpus, load_checkpoint, read_identifier_file, write_identifier_file, GapAnalyzer,
    HarvestConfig, Harvester, ListingCache, Recollector,
};
use steamset_materialize::{write_validation_report, MaterializeConfig, Materializer, Validator};
use steamset_storage::PgCatalogStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_PROMPT_COUNT: usize = 100;

#[derive(Debug, Parser)]
#[command(name = "steamset-cli")]
#[command(about = "Steam catalog harvest and requirements materialization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Draw random catalog identifiers and collect their detail documents.
    Harvest(HarvestArgs),
    /// Re-fetch identifiers missing from a collection and merge the recovered ones.
    Recollect(RecollectArgs),
    /// Load a collection document into the catalog database.
    Import(ImportArgs),
    /// Apply database migrations.
    Migrate,
    /// Derive text columns from stored requirements markup.
    Materialize(MaterializeArgs),
    /// Re-parse raw requirements and compare against materialized values.
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
struct HarvestArgs {
    /// Number of successful entries to collect (prompted when omitted on a terminal)
    #[arg(long)]
    count: Option<usize>,
    /// Minimum seconds between request starts
    #[arg(long)]
    delay: Option<f64>,
    #[arg(long)]
    output: Option<PathBuf>,
    /// Continue the run stored in this checkpoint
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long)]
    checkpoint_every: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    listing_cache: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RecollectArgs {
    /// Collection document to fill in
    #[arg(long)]
    input: PathBuf,
    /// Where to write the updated collection (defaults to the input)
    #[arg(long)]
    output: Option<PathBuf>,
    /// File with one expected identifier per line
    #[arg(long, conflicts_with = "from_listing")]
    expected: Option<PathBuf>,
    /// Use the filtered bulk listing as the expected universe
    #[arg(long)]
    from_listing: bool,
    /// Only write the missing identifiers to this file; fetch nothing
    #[arg(long)]
    write_missing: Option<PathBuf>,
    #[arg(long)]
    delay: Option<f64>,
    #[arg(long)]
    checkpoint_every: Option<usize>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Debug, Args)]
struct MaterializeArgs {
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// Validate a random fraction of rows, e.g. 0.1
    #[arg(long, conflicts_with = "full")]
    sample: Option<f64>,
    /// Validate every row (the default)
    #[arg(long)]
    full: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    /// Exit non-zero when any mismatch is found
    #[arg(long)]
    require_pass: bool,
    /// Exit non-zero when the pass rate is below this fraction, e.g. 0.99
    #[arg(long)]
    min_pass_rate: Option<f64>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn parse_delay(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("invalid delay {secs}"))
}

/// Asks for the target count on an interactive terminal; otherwise keeps `fallback`.
fn resolve_target_count(requested: Option<usize>, fallback: usize) -> Result<usize> {
    if let Some(count) = requested {
        return Ok(count);
    }
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(fallback);
    }
    let mut lines = stdin.lock();
    loop {
        print!("How many games to collect? [{DEFAULT_PROMPT_COUNT}]: ");
        io::stdout().flush().context("flushing prompt")?;
        let mut line = String::new();
        if lines.read_line(&mut line).context("reading target count")? == 0 {
            return Ok(DEFAULT_PROMPT_COUNT);
        }
        let line = line.trim();
        if line.is_empty() {
            return Ok(DEFAULT_PROMPT_COUNT);
        }
        match line.parse::<usize>() {
            Ok(count) if count > 0 => return Ok(count),
            _ => eprintln!("please enter a positive whole number"),
        }
    }
}

async fn connect_store() -> Result<PgCatalogStore> {
    let config = MaterializeConfig::from_env();
    PgCatalogStore::connect(&config.database_url).await
}

async fn run_harvest(args: HarvestArgs) -> Result<()> {
    let mut config = HarvestConfig::from_env();
    if let Some(delay) = args.delay {
        config.rate_limit = parse_delay(delay)?;
    }
    if let Some(every) = args.checkpoint_every {
        config.checkpoint_every = every;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.listing_cache.is_some() {
        config.listing_cache = args.listing_cache;
    }
    match (&args.output, &args.resume) {
        (Some(output), _) => config.output_path = output.clone(),
        (None, Some(resume)) => config.output_path = resume.clone(),
        (None, None) => {}
    }
    config.target_count = resolve_target_count(args.count, config.target_count)?;

    let resume_from = match &args.resume {
        Some(path) => Some(load_checkpoint(path).await?),
        None => None,
    };
    let client = RateLimitedClient::new(config.client_settings())?;
    let harvester = Harvester::new(Arc::new(client), config);
    let done = harvester.harvest(resume_from).await?;

    let metadata = &done.collection.metadata;
    println!(
        "harvest complete: run_id={} succeeded={}/{} attempted={} \
         success_rate={:.1}% stop={:?} output={}",
        metadata.run_id,
        metadata.actual_count,
        metadata.target_count,
        metadata.attempted_count,
        metadata.success_rate * 100.0,
        done.stop_reason(),
        metadata.output_reference
    );
    Ok(())
}

async fn run_recollect(args: RecollectArgs) -> Result<()> {
    let mut config = HarvestConfig::from_env();
    if let Some(delay) = args.delay {
        config.rate_limit = parse_delay(delay)?;
    }
    if let Some(every) = args.checkpoint_every {
        config.checkpoint_every = every;
    }
    let run = load_checkpoint(&args.input).await?;
    let client: Arc<dyn CatalogApi> = Arc::new(RateLimitedClient::new(config.client_settings())?);

    let expected: BTreeSet<CatalogId> = if let Some(path) = &args.expected {
        read_identifier_file(path).await?
    } else if args.from_listing {
        let listings = match &config.listing_cache {
            Some(path) => ListingCache::new(path).load_or_fetch(client.as_ref()).await?,
            None => client.list_catalog().await?,
        };
        listings
            .into_iter()
            .map(|l| l.identifier)
            .filter(|&id| id > config.id_threshold)
            .collect()
    } else {
        run.entries.identifiers()
    };

    let missing = GapAnalyzer::missing(&expected, &run.entries);
    info!(expected = expected.len(), missing = missing.len(), "gap analysis complete");

    if let Some(path) = &args.write_missing {
        write_identifier_file(path, &missing).await?;
        println!("missing identifiers: {} written to {}", missing.len(), path.display());
        return Ok(());
    }

    let output = args.output.unwrap_or_else(|| args.input.clone());
    let recollector = Recollector::new(
        client,
        &output,
        config.checkpoint_every,
        config.wanted_type.clone(),
    );
    let (run, summary) = recollector.recollect(run, &missing).await?;
    let still_missing = GapAnalyzer::missing(&expected, &run.entries);
    println!(
        "recollect complete: requested={} recovered={} failed={} skipped={} \
         still_missing={} output={}",
        summary.requested,
        summary.recovered(),
        summary.failed,
        summary.skipped,
        still_missing.len(),
        output.display()
    );
    Ok(())
}

async fn run_import(args: ImportArgs) -> Result<()> {
    let config = MaterializeConfig::from_env();
    let run = load_checkpoint(&args.input).await?;
    let store = connect_store().await?;
    let summary = import_corpus(&store, &run, args.batch_size.unwrap_or(config.batch_size)).await?;
    println!(
        "import complete: entries={} batches={} rows_written={}",
        summary.entries, summary.batches, summary.rows_written
    );
    Ok(())
}

async fn run_materialize(args: MaterializeArgs) -> Result<()> {
    let config = MaterializeConfig::from_env();
    let registry = config.registry()?;
    let store = Arc::new(connect_store().await?);
    let summary = Materializer::new(store, registry)
        .materialize(args.batch_size.unwrap_or(config.batch_size))
        .await?;
    println!(
        "materialize complete: rows_updated={} rows_skipped={} fields_written={} batches={}",
        summary.rows_updated, summary.rows_skipped, summary.fields_written, summary.batches
    );
    Ok(())
}

async fn run_validate(args: ValidateArgs) -> Result<()> {
    let config = MaterializeConfig::from_env();
    let scope = match args.sample {
        Some(fraction) if !args.full => ValidationScope::Sample {
            fraction,
            seed: args.seed,
        },
        _ => ValidationScope::Full,
    };
    if let Some(minimum) = args.min_pass_rate {
        if !(0.0..=1.0).contains(&minimum) {
            bail!("--min-pass-rate must be a fraction between 0 and 1, got {minimum}");
        }
    }
    let store = Arc::new(connect_store().await?);
    let report = Validator::new(store, config.registry()?, config.batch_size)
        .validate(scope)
        .await?;
    let reports_dir = args.reports_dir.unwrap_or(config.reports_dir);
    let written = write_validation_report(&reports_dir, &report).await?;

    println!(
        "validate complete: comparisons={} mismatches={} pass_rate={:.4}% \
         certifies_release={} report={}",
        report.total_comparisons,
        report.mismatch_count,
        report.pass_rate * 100.0,
        report.certifies_release(),
        written.display()
    );
    if args.require_pass && !report.passed() {
        bail!("validation found {} mismatches", report.mismatch_count);
    }
    if let Some(minimum) = args.min_pass_rate {
        if !report.meets_pass_rate(minimum) {
            bail!(
                "pass rate {:.4}% is below the required {:.4}%",
                report.pass_rate * 100.0,
                minimum * 100.0
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Harvest(args) => run_harvest(args).await?,
        Commands::Recollect(args) => run_recollect(args).await?,
        Commands::Import(args) => run_import(args).await?,
        Commands::Migrate => {
            connect_store().await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Materialize(args) => run_materialize(args).await?,
        Commands::Validate(args) => run_validate(args).await?,
    }

    Ok(())
}
