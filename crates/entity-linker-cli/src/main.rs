//! Entity linker CLI
//!
//! - `link`: resolve a word list (CSV/space-delimited, first column) into
//!   `embedding_label,knowledgebase_id` pairs plus not-found/unprocessed lists
//! - `lookup`: resolve a few names given on the command line
//! - `tools`: post-process linking files

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use entity_linker_core::{
    BatchDispatcher, DispatchOptions, EntityLinker, LinkerConfig, OutputSinks, PersistentCache,
    ResolutionProxy,
};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

mod tools;

#[derive(Parser)]
#[command(name = "entity-linker")]
#[command(author, version, about = "Link words and titles to knowledge-base ids")]
struct Cli {
    /// JSON config file (fields of `LinkerConfig`; missing fields use defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link every name in a word list, using and extending the cache.
    Link(LinkArgs),

    /// Resolve names given on the command line.
    Lookup {
        /// Names to resolve.
        #[arg(required = true)]
        names: Vec<String>,

        /// Linking cache log.
        #[arg(long, default_value = "linking_cache.csv")]
        cache: PathBuf,
    },

    /// Post-processing of linking files.
    Tools {
        #[command(subcommand)]
        command: tools::ToolsCommands,
    },
}

#[derive(Args)]
struct LinkArgs {
    /// Input word list; the first column is the name, the first row a header.
    #[arg(short, long)]
    input: PathBuf,

    /// Linked pairs (`embedding_label,knowledgebase_id`).
    #[arg(short, long)]
    output: PathBuf,

    /// Names with no link, one per line.
    #[arg(long)]
    not_found: PathBuf,

    /// Names of chunks that failed, one per line (for re-submission).
    #[arg(long)]
    unprocessed: Option<PathBuf>,

    /// Linking cache log (created if missing).
    #[arg(long, default_value = "linking_cache.csv")]
    cache: PathBuf,

    /// Worker threads.
    #[arg(long)]
    workers: Option<usize>,

    /// Names claimed per worker iteration.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Input field delimiter (single byte, `\t` and `space` accepted).
    #[arg(long, default_value = ",")]
    delimiter: String,

    /// Treat `"` in the input as a literal character.
    #[arg(long)]
    no_quoting: bool,

    /// Do not retry batch misses one at a time.
    #[arg(long)]
    no_single_fallback: bool,

    /// Append to existing output files instead of truncating them.
    #[arg(long)]
    append: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => LinkerConfig::from_file(path)?,
        None => LinkerConfig::default(),
    };
    config.apply_env()?;
    tracing::debug!(?config, "effective configuration");

    match cli.command {
        Commands::Link(args) => cmd_link(config, args),
        Commands::Lookup { names, cache } => cmd_lookup(config, &names, &cache),
        Commands::Tools { command } => tools::cmd_tools(command),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose {
        "entity_linker=debug"
    } else {
        "entity_linker=info"
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn cmd_link(mut config: LinkerConfig, args: LinkArgs) -> Result<()> {
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if args.no_single_fallback {
        config.single_fallback = false;
    }
    config.validate()?;

    let options = DispatchOptions {
        delimiter: parse_delimiter(&args.delimiter)?,
        quoting: !args.no_quoting,
        ..DispatchOptions::from_config(&config)
    };
    let dispatcher = BatchDispatcher::new(options)?;

    let cache = Arc::new(
        PersistentCache::open(&args.cache)
            .with_context(|| format!("failed to open cache {}", args.cache.display()))?,
    );
    let input = File::open(&args.input)
        .with_context(|| format!("failed to open input {}", args.input.display()))?;

    let unprocessed_path = args
        .unprocessed
        .clone()
        .unwrap_or_else(|| sibling(&args.not_found, "unprocessed"));
    let mut sinks = OutputSinks::new(
        open_output(&args.output, args.append)?,
        open_output(&args.not_found, args.append)?,
        open_output(&unprocessed_path, args.append)?,
    )?;

    println!(
        "{} input={} cache={} ({} cached) workers={} chunk_size={}",
        "Link".green().bold(),
        args.input.display(),
        args.cache.display(),
        cache.len(),
        config.workers,
        config.chunk_size
    );

    let started = Instant::now();
    let report = dispatcher.run(input, &mut sinks, |_| {
        ResolutionProxy::from_config(Arc::clone(&cache), &config)
    })?;
    sinks.flush()?;
    drop(sinks);

    let cache = Arc::try_unwrap(cache).map_err(|_| anyhow!("cache still shared after dispatch"))?;
    let appended = cache.appended();
    cache.close()?;

    println!(
        "  {} linked={} not_found={} skipped={} in {:.1}s",
        "→".yellow(),
        report.linked,
        report.not_found,
        report.names_skipped,
        started.elapsed().as_secs_f64()
    );
    println!(
        "  {} remote_requests={} new_cache_rows={}",
        "→".yellow(),
        report.remote_requests,
        appended
    );
    if report.chunks_failed > 0 {
        println!(
            "  {} {} chunks failed; {} names written to {}",
            "!".red().bold(),
            report.chunks_failed,
            report.unprocessed,
            unprocessed_path.display()
        );
    }
    println!("  {} {}", "→".cyan(), args.output.display());
    println!("  {} {}", "→".cyan(), args.not_found.display());

    Ok(())
}

fn cmd_lookup(config: LinkerConfig, names: &[String], cache_path: &Path) -> Result<()> {
    config.validate()?;
    let cache = Arc::new(
        PersistentCache::open(cache_path)
            .with_context(|| format!("failed to open cache {}", cache_path.display()))?,
    );
    let proxy = ResolutionProxy::from_config(Arc::clone(&cache), &config)?;

    let mut not_found = BTreeSet::new();
    let mut found = Vec::new();
    if let [name] = names {
        match proxy.resolve_single(name)? {
            Some(entity) => found.push(entity),
            None => {
                not_found.insert(name.clone());
            }
        }
    } else {
        let resolved = proxy.resolve(names, &mut not_found)?;
        found.extend(names.iter().filter_map(|n| resolved.get(n).cloned()));
    }

    println!("{}", "Found entities:".green().bold());
    for entity in &found {
        println!("  {entity}");
    }
    println!();
    println!("{}", "Not found entities:".yellow().bold());
    for name in &not_found {
        println!("  {name}");
    }
    println!();
    println!(
        "  {} remote_requests={}",
        "→".cyan(),
        proxy.remote_requests()
    );
    Ok(())
}

fn parse_delimiter(s: &str) -> Result<u8> {
    match s {
        "\\t" | "tab" => Ok(b'\t'),
        "space" => Ok(b' '),
        _ => match s.as_bytes() {
            [b] => Ok(*b),
            _ => Err(anyhow!("--delimiter must be a single byte, got `{s}`")),
        },
    }
}

fn open_output(path: &Path, append: bool) -> Result<BufWriter<File>> {
    let file = if append {
        OpenOptions::new().create(true).append(true).open(path)
    } else {
        File::create(path)
    }
    .with_context(|| format!("failed to open output {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// `dir/<stem>.<suffix>.txt` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!("{stem}.{suffix}.txt"))
}
