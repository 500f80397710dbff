use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use imgfacet::{
    config::Config,
    embeddings::{EmbeddingProvider, LocalEmbeddingProvider, TeiEmbeddingProvider},
    llm::OllamaLlmProvider,
    utils, DesktopNotifier, FacetGenerator, IndexError, IndexingPipeline, LiveIndexer, LlmDescriber,
    LogNotifier, Notifier, SearchAggregator, VectorIndex,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgfacet")]
#[command(about = "Semantic image search: find pictures in your folders by describing them")]
#[command(version)]
struct Cli {
    /// Settings file (default: config/settings.toml, then ~/.config/imgfacet/settings.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every image below a directory
    Index {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Search indexed images with a text query
    Search {
        #[arg(value_name = "QUERY")]
        query: String,
        /// Number of images to return (overrides config)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Remove one image from the index
    Remove {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Re-run captioning and embedding for one image
    Reindex {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Keep directories indexed as files change (Ctrl+C to stop)
    Watch {
        /// Directories to watch (default: watch.directories from config)
        #[arg(value_name = "DIR")]
        dirs: Vec<PathBuf>,
    },
    /// Drop entries of deleted files and index anything new or changed
    Reconcile {
        #[arg(value_name = "DIR")]
        dirs: Vec<PathBuf>,
    },
    /// Print stored facet captions
    Captions {
        /// Only this image
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Show index statistics
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        if let Some(IndexError::StoreCorrupt(msg)) = err.downcast_ref::<IndexError>() {
            eprintln!("❌ The image index is corrupt: {}", msg);
            eprintln!("   Refusing to index or search. Restore the store directory from a backup or delete it to rebuild.");
            std::process::exit(2);
        }
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "imgfacet=debug" } else { "imgfacet=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    config.validate()?;
    let index = open_index(&config)?;

    match cli.command {
        Commands::Index { dir } => {
            let pipeline = build_pipeline(&config, index)?;
            let dir = dir
                .canonicalize()
                .with_context(|| format!("Cannot access directory: {}", dir.display()))?;
            let total = utils::scan_images(&dir).len();
            println!("📂 Indexing {} images in {}", total, dir.display());

            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({msg})")
                    .context("Invalid progress bar template")?
                    .progress_chars("#>-"),
            );
            let summary = pipeline
                .index_directory_with(&dir, |path, result| {
                    pb.inc(1);
                    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                    match result {
                        Ok(_) => pb.set_message(name),
                        Err(e) => pb.println(format!("⚠️  {}: {}", path.display(), e)),
                    }
                })
                .await?;
            pb.finish_and_clear();

            println!(
                "✓ {} added, {} updated, {} unchanged, {} failed",
                summary.added, summary.updated, summary.unchanged, summary.failed
            );
        }
        Commands::Search { query, top_k } => {
            let search = SearchAggregator::new(index.clone(), build_embedder(&config), config.search_options());
            let top_k = top_k.unwrap_or(config.search.top_k);
            let results = search.query(&query, top_k).await?;

            // Files deleted while nothing was watching
            for image_id in &results.vanished {
                let removed = index.delete_by_image(image_id).await.map_err(IndexError::from)?;
                tracing::info!(image = %image_id, removed, "dropped image whose file is gone");
            }

            let hits = results.hits;
            if hits.is_empty() {
                println!("No matching images.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. {} ({:.3}, {})", i + 1, hit.image_id, hit.score, hit.facet);
                println!("   {}", hit.caption);
            }
        }
        Commands::Remove { path } => {
            let pipeline = build_pipeline(&config, index)?;
            let removed = pipeline.remove_image(&path).await?;
            if removed == 0 {
                println!("{} was not indexed", path.display());
            } else {
                println!("✓ Removed {} ({} facet entries)", path.display(), removed);
            }
        }
        Commands::Reindex { path } => {
            let pipeline = build_pipeline(&config, index)?;
            let indexed = pipeline.reindex_image(&path).await?;
            println!("✓ Reindexed {}", indexed.image_id);
            for (facet, caption) in indexed.facets.iter() {
                println!("  {}: {}", facet, caption);
            }
        }
        Commands::Watch { dirs } => {
            let dirs = directories_or_configured(dirs, &config)?;
            let pipeline = build_pipeline(&config, index)?;
            let notifier: Arc<dyn Notifier> = if config.watch.desktop_notifications {
                Arc::new(DesktopNotifier::default())
            } else {
                Arc::new(LogNotifier)
            };

            let mut live = LiveIndexer::new(pipeline, notifier, config.watch_settings());
            live.start(&dirs)?;
            for dir in live.watched() {
                println!("👀 Watching {}", dir.display());
            }
            println!("Press Ctrl+C to stop.");

            let finished = tokio::select! {
                _ = tokio::signal::ctrl_c() => None,
                result = live.wait() => Some(result),
            };
            match finished {
                None => {
                    println!("Stopping...");
                    live.stop().await?;
                }
                Some(result) => result?,
            }
        }
        Commands::Reconcile { dirs } => {
            let dirs = directories_or_configured(dirs, &config)?;
            let pipeline = build_pipeline(&config, index)?;
            for dir in dirs {
                let summary = pipeline.reconcile(&dir).await?;
                println!(
                    "✓ {}: {} removed, {} added, {} updated, {} unchanged, {} failed",
                    dir.display(),
                    summary.removed,
                    summary.added,
                    summary.updated,
                    summary.unchanged,
                    summary.failed
                );
            }
        }
        Commands::Captions { path } => {
            let snapshot = index.snapshot();
            let wanted = path.as_deref().map(utils::image_id);
            let mut records: Vec<_> = snapshot
                .records()
                .filter(|r| r.is_indexed())
                .filter(|r| wanted.as_deref().map_or(true, |id| r.id == id))
                .collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));

            if records.is_empty() {
                println!("No captions stored.");
            }
            for record in records {
                println!("{}", record.path.display());
                for (facet, caption) in snapshot.captions_for(&record.id) {
                    println!("  {}: {}", facet, caption);
                }
            }
        }
        Commands::Status => {
            let stats = index.stats();
            println!("Store:      {}", index.dir().display());
            println!("Facets:     {}", index.facet_names().as_slice().join(", "));
            println!("Indexed:    {} images", stats.images_indexed);
            println!("Failed:     {} images", stats.images_failed);
            println!("Entries:    {}", stats.entries);
            match stats.dims {
                Some(dims) => println!("Dimensions: {}", dims),
                None => println!("Dimensions: (empty index)"),
            }
            let snapshot = index.snapshot();
            for record in snapshot.records().filter(|r| !r.is_indexed()) {
                println!(
                    "  ⚠️  {}: {}",
                    record.path.display(),
                    record.last_error.as_deref().unwrap_or("not indexed")
                );
            }
        }
    }

    Ok(())
}

fn open_index(config: &Config) -> Result<Arc<VectorIndex>> {
    let path = config.store_path();
    let index = VectorIndex::load_or_create(&path, config.facet_names()?).map_err(IndexError::from)?;
    Ok(Arc::new(index))
}

fn build_embedder(config: &Config) -> Arc<dyn EmbeddingProvider> {
    let timeout = config.model_timeout();
    if config.embedding_provider == "tei" {
        tracing::info!(url = %config.tei.url, dims = config.tei.dims, "using TEI embeddings");
        Arc::new(TeiEmbeddingProvider::new(
            Some(&config.tei.url),
            Some(config.tei.dims),
            timeout,
        ))
    } else {
        tracing::info!(model = %config.ollama.embed_model, "using Ollama embeddings");
        Arc::new(LocalEmbeddingProvider::new(
            Some(&config.ollama.url),
            Some(&config.ollama.embed_model),
            config.ollama.dims,
            timeout,
        ))
    }
}

fn build_pipeline(config: &Config, index: Arc<VectorIndex>) -> Result<Arc<IndexingPipeline>> {
    let timeout = config.model_timeout();
    let vision = OllamaLlmProvider::new(Some(&config.ollama.url), &config.ollama.vision_model, timeout);
    let captioner = OllamaLlmProvider::new(Some(&config.ollama.url), &config.ollama.caption_model, timeout);

    let pipeline = IndexingPipeline::new(
        Arc::new(LlmDescriber::new(Arc::new(vision))),
        FacetGenerator::new(Arc::new(captioner), config.facet_names()?),
        build_embedder(config),
        index,
        config.pipeline_options(),
    )?;
    Ok(Arc::new(pipeline))
}

fn directories_or_configured(dirs: Vec<PathBuf>, config: &Config) -> Result<Vec<PathBuf>> {
    let dirs = if dirs.is_empty() { config.watch_directories() } else { dirs };
    if dirs.is_empty() {
        bail!("No directories given and watch.directories is empty in the configuration");
    }
    for dir in &dirs {
        if !Path::new(dir).is_dir() {
            bail!("Not a directory: {}", dir.display());
        }
    }
    Ok(dirs)
}
