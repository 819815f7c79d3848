//! iq CLI: search image folders by text description

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use iq_core::{
    AbortReason, BuildOutcome, BuildReport, BuildRequest, CheckpointStore, Config, DateFilter,
    Engine, FingerprintCache, IQ_DIR, IqError, MemoryPolicy, Progress, ProgressCallback,
    ProgressEvent, SearchResult, StoreLayout, SystemMemory, find_iq_root, load_last_folders,
};

#[derive(Parser)]
#[command(name = "iq")]
#[command(about = "Search image folders by text description", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Search query (when no subcommand is given)
    #[arg(trailing_var_arg = true)]
    query: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new .iq repository
    Init,

    /// Build or resume the image index
    Index {
        /// Folders to index (default: the last indexed selection)
        folders: Vec<PathBuf>,

        /// Only index images directly inside each folder
        #[arg(long)]
        no_recursive: bool,

        /// Only index images modified in the last N days
        #[arg(long)]
        days: Option<u32>,

        /// Ignore cached vectors and re-encode everything
        #[arg(long)]
        force: bool,
    },

    /// Search indexed images
    Search {
        /// Search query
        query: Vec<String>,

        /// Maximum number of results
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Minimum similarity score
        #[arg(short = 't', long)]
        threshold: Option<f32>,
    },

    /// Show cache, checkpoint and memory status
    Status,

    /// Delete all cached vectors
    ClearCache,

    /// Delete old checkpoints
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => cmd_init()?,
        Some(Commands::Index {
            folders,
            no_recursive,
            days,
            force,
        }) => cmd_index(folders, !no_recursive, days, force).await?,
        Some(Commands::Search {
            query,
            limit,
            threshold,
        }) => {
            let query = query.join(" ");
            cmd_search(&query, limit, threshold).await?;
        }
        Some(Commands::Status) => cmd_status()?,
        Some(Commands::ClearCache) => cmd_clear_cache()?,
        Some(Commands::Prune) => cmd_prune()?,
        None => {
            if cli.query.is_empty() {
                println!("Usage: iq <query> or iq <command>");
                println!("Run 'iq --help' for more information.");
            } else {
                let query = cli.query.join(" ");
                cmd_search(&query, None, None).await?;
            }
        }
    }

    Ok(())
}

fn repo_root() -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    find_iq_root(&cwd).context("Not in an iq repository. Run 'iq init' first.")
}

fn cmd_init() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let iq_dir = cwd.join(IQ_DIR);

    if iq_dir.exists() {
        return Err(IqError::AlreadyInitialized(iq_dir).into());
    }

    std::fs::create_dir(&iq_dir)?;
    Config::default().save(&cwd)?;

    println!("Initialized iq repository in {}", iq_dir.display());
    println!("Run 'iq index <folder>...' to index images.");

    Ok(())
}

async fn cmd_index(
    folders: Vec<PathBuf>,
    recursive: bool,
    days: Option<u32>,
    force: bool,
) -> Result<()> {
    let root = repo_root()?;
    let engine = Arc::new(Engine::open(&root)?);

    let days = days.map(DateFilter::ModifiedWithinDays);
    let request = if folders.is_empty() {
        let selection = engine
            .last_folders()
            .context("No folders given and no previous selection. Run 'iq index <folder>...'.")?;
        let request = selection.to_request();
        match days {
            Some(_) => request.date_filter(days),
            None => request,
        }
    } else {
        let cwd = std::env::current_dir()?;
        BuildRequest::new(folders.iter().map(|f| cwd.join(f)).collect())
            .recursive(recursive)
            .date_filter(days)
    }
    .force_rebuild(force);

    if let Some(checkpoint) = engine.resume_point(&request.folders).filter(|_| !force) {
        println!(
            "Resuming previous build: {}/{} chunks done",
            checkpoint.processed_chunk_index, checkpoint.total_chunks
        );
    }

    let report = run_build(&engine, request).await?;
    print_report(&report);

    if let BuildOutcome::Ready = report.outcome {
        let stats = engine.index_stats();
        println!();
        for (folder, count) in &stats.folders {
            println!("  {:>6}  {}", count, folder.display());
        }
    }

    Ok(())
}

/// Run a build on a blocking worker with a progress bar; Ctrl-C cancels it
/// at the next chunk boundary.
async fn run_build(engine: &Arc<Engine>, request: BuildRequest) -> Result<BuildReport> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("█▓░"),
    );
    pb.set_message("Scanning...");

    let callback: ProgressCallback = Box::new({
        let pb = pb.clone();
        move |progress: Progress<'_>| {
            pb.set_position(u64::from(progress.percent));
            match progress.event {
                ProgressEvent::Scanning {
                    folder_index,
                    folder_count,
                    folder,
                    files_seen,
                } => {
                    pb.set_message(format!(
                        "Scanning {}/{} {} ({} files)",
                        folder_index + 1,
                        folder_count,
                        folder.display(),
                        files_seen
                    ));
                }
                ProgressEvent::Reconciled {
                    cached, pending, ..
                } => {
                    pb.set_message(format!("{} cached, {} to encode", cached, pending));
                }
                ProgressEvent::LowMemory {
                    available_gb,
                    chunk_size,
                } => {
                    pb.println(format!(
                        "Low memory ({:.1} GB available), using chunks of {}",
                        available_gb, chunk_size
                    ));
                }
                ProgressEvent::ChunkStarted {
                    chunk,
                    total_chunks,
                    files,
                } => {
                    pb.set_message(format!("Chunk {}/{} ({} images)", chunk, total_chunks, files));
                }
                ProgressEvent::Encoding { chunk, done, total } => {
                    pb.set_message(format!("Chunk {}: {}/{} images", chunk, done, total));
                }
                ProgressEvent::Finalizing => pb.set_message("Finalizing..."),
                ProgressEvent::Finished { .. } => {}
            }
        }
    });

    let cancel = engine.cancel_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = engine.spawn_build(request, Some(callback)).await;
    ctrl_c.abort();
    pb.finish_and_clear();

    Ok(result.context("Build worker failed")??)
}

fn print_report(report: &BuildReport) {
    match &report.outcome {
        BuildOutcome::Ready => println!("✓ Indexing complete:"),
        BuildOutcome::Cancelled => {
            println!("Indexing cancelled. Run the same command again to resume.")
        }
        BuildOutcome::Aborted(reason) => {
            let AbortReason::InsufficientMemory {
                available_gb,
                required_gb,
            } = reason;
            println!(
                "Indexing stopped: {:.1} GB memory available, {:.1} GB required.",
                available_gb, required_gb
            );
            println!("Free some memory and run the same command again to resume.");
        }
    }
    println!("  Images found:   {}", report.files_found);
    println!("  From cache:     {}", report.files_cached);
    println!("  Encoded:        {}", report.files_encoded);
    println!("  Failed:         {}", report.files_failed);
    println!(
        "  Chunks:         {}/{}",
        report.chunks_processed, report.total_chunks
    );
    println!("  Time:           {:.1}s", report.elapsed.as_secs_f64());
}

async fn cmd_search(query: &str, limit: Option<usize>, threshold: Option<f32>) -> Result<()> {
    let root = repo_root()?;
    let engine = Arc::new(Engine::open(&root)?);
    let selection = engine
        .last_folders()
        .context("Nothing indexed yet. Run 'iq index <folder>...' first.")?;

    // Picks up the cached vectors and encodes anything new since the last run
    let report = run_build(&engine, selection.to_request()).await?;
    if !report.outcome.is_ready() {
        print_report(&report);
        return Ok(());
    }

    let config = engine.config();
    let results = engine.search(
        query,
        limit.unwrap_or(config.max_results_default),
        threshold.unwrap_or(config.similarity_threshold),
    )?;

    if results.is_empty() {
        println!("No results found for: {}", query);
        return Ok(());
    }

    println!("Results for: {}\n", query);
    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result, &root);
    }

    Ok(())
}

fn print_result(index: usize, result: &SearchResult, root: &Path) {
    let score_color = if result.score > 0.3 {
        "\x1b[32m" // Green for high scores
    } else if result.score > 0.2 {
        "\x1b[33m" // Yellow for medium scores
    } else {
        "\x1b[31m" // Red for low scores
    };
    let shown = result.path.strip_prefix(root).unwrap_or(&result.path);
    let modified = result
        .file_info
        .modified
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());

    println!(
        "\x1b[1;36m[{}]\x1b[0m {}{:.3}\x1b[0m  \x1b[1m{}\x1b[0m",
        index,
        score_color,
        result.score,
        shown.display(),
    );
    println!(
        "      \x1b[2m{}  {}  {}\x1b[0m",
        result.file_info.folder_name,
        format_size(result.file_info.size_bytes),
        modified
    );
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

fn cmd_status() -> Result<()> {
    let root = repo_root()?;
    let config = Config::load(&root)?;
    let layout = StoreLayout::new(&root);
    let cache = FingerprintCache::open(&layout, config.fingerprint_mode);
    let selection = load_last_folders(&layout);
    let cache_stats = cache.stats();
    let checkpoints = CheckpointStore::new(&layout.checkpoints).list();
    let memory = MemoryPolicy::from_config(&config).describe(&SystemMemory::new());

    println!("iq repository: {}", root.display());
    println!();
    println!("Configuration:");
    println!("  Model: {}", config.image_model);
    println!(
        "  Chunk size: {} (min {})",
        config.base_chunk_size, config.min_chunk_size
    );
    println!(
        "  Memory floors: {:.1} GB hard, {:.1} GB warning",
        config.min_memory_gb, config.warning_memory_gb
    );
    println!();
    println!("Cache:");
    println!("  Cached images: {}", cache_stats.entry_count);
    println!("  Image bytes:   {}", format_size(cache_stats.total_bytes));
    if let (Some(oldest), Some(newest)) = (cache_stats.oldest, cache_stats.newest) {
        println!(
            "  Cached between {} and {}",
            oldest.format("%Y-%m-%d %H:%M"),
            newest.format("%Y-%m-%d %H:%M")
        );
    }
    if let Some(selection) = selection {
        println!();
        println!(
            "Last selection ({}):",
            if selection.recursive { "recursive" } else { "top level only" }
        );
        match selection.date_filter {
            Some(DateFilter::ModifiedWithinDays(days)) => {
                println!("  Modified within {} days", days)
            }
            Some(DateFilter::ModifiedSince(since)) => {
                println!("  Modified since {}", since.format("%Y-%m-%d %H:%M"))
            }
            None => {}
        }
        for folder in &selection.folders {
            let count = cache.paths().filter(|p| p.starts_with(folder)).count();
            println!("  {:>6}  {}", count, folder.display());
        }
    }
    println!();
    println!("Unfinished builds: {}", checkpoints.len());
    for checkpoint in &checkpoints {
        println!(
            "  {}/{} chunks, saved {}, {} folders",
            checkpoint.processed_chunk_index,
            checkpoint.total_chunks,
            checkpoint.saved_at.format("%Y-%m-%d %H:%M"),
            checkpoint.folders.len()
        );
    }
    println!();
    println!("Memory:");
    println!(
        "  {:.1} GB available of {:.1} GB ({:.0}% used)",
        memory.available_gb, memory.total_gb, memory.percent_used
    );
    if !memory.can_continue {
        println!("  Below the hard floor: builds will not start");
    } else if memory.below_warning {
        println!("  Below the warning floor: builds use smaller chunks");
    }

    Ok(())
}

fn cmd_clear_cache() -> Result<()> {
    let root = repo_root()?;
    let config = Config::load(&root)?;
    let mut cache = FingerprintCache::open(&StoreLayout::new(&root), config.fingerprint_mode);
    let count = cache.len();
    cache.clear();
    println!("Removed {} cached images", count);
    Ok(())
}

fn cmd_prune() -> Result<()> {
    let root = repo_root()?;
    let config = Config::load(&root)?;
    let store = CheckpointStore::new(StoreLayout::new(&root).checkpoints);
    let removed = store.prune_older_than(chrono::Duration::days(i64::from(
        config.checkpoint_max_age_days,
    )));
    println!("Removed {} old checkpoints", removed);
    Ok(())
}
