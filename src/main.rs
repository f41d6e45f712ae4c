use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facefind::config::{self, Config};
use facefind::fetch::ImageFetcher;
use facefind::indexer::{self, EmptyFacePolicy, Indexer};
use facefind::matcher::Matcher;
use facefind::onnx::OnnxLoader;
use facefind::provider::EmbeddingProviderHandle;
use facefind::remote::{RemoteClient, StoreState};
use facefind::search::{self, SearchOutcome};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "facefind")]
#[command(version, about = "Find gallery photos by face")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set the gallery endpoint (plain or base64-encoded URL)
    Endpoint { url: String },
    /// List gallery files
    List {
        #[arg(short, long)]
        folder: Option<String>,
    },
    /// Index faces of gallery images not yet in the store
    Index {
        #[arg(short, long)]
        folder: Option<String>,
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Save the store after every batch instead of once at the end
        #[arg(long)]
        every_batch: bool,
        /// Remember images without faces so they are not retried
        #[arg(long)]
        record_empty: bool,
        /// Index even if the existing store could not be loaded (overwrites it)
        #[arg(long)]
        fresh: bool,
    },
    /// Find gallery images containing the face in a reference photo
    Search {
        image: PathBuf,
        #[arg(short, long)]
        threshold: Option<f32>,
        #[arg(short, long)]
        folder: Option<String>,
    },
    /// Show the state of the embedding store
    Status,
    /// Open config file in editor
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();
    let cfg = config::load_config(config_path)?;

    match cli.command {
        Commands::Endpoint { url } => set_endpoint(cfg, config_path, &url),
        Commands::List { folder } => list(&cfg, folder.as_deref()).await,
        Commands::Index {
            folder,
            batch_size,
            every_batch,
            record_empty,
            fresh,
        } => {
            let mut cfg = cfg;
            if let Some(n) = batch_size {
                cfg.batch_size = n;
            }
            cfg.persist_every_batch |= every_batch;
            if record_empty {
                cfg.empty_face_policy = EmptyFacePolicy::Record;
            }
            index(&cfg, folder.as_deref(), fresh).await
        }
        Commands::Search {
            image,
            threshold,
            folder,
        } => {
            let matcher = threshold.map(Matcher::new).unwrap_or_else(|| cfg.matcher());
            search(&cfg, &image, &matcher, folder.as_deref()).await
        }
        Commands::Status => status(&cfg).await,
        Commands::Config => open_config(config_path),
    }
}

fn http_client(cfg: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(cfg.request_timeout())
        .build()
        .context("building http client")
}

fn remote(cfg: &Config) -> Result<RemoteClient> {
    Ok(RemoteClient::new(http_client(cfg)?, cfg.endpoint()?)?)
}

fn provider_handle(cfg: &Config) -> Result<EmbeddingProviderHandle<OnnxLoader>> {
    // weights are large, so no overall request timeout here
    let client = reqwest::Client::builder()
        .connect_timeout(cfg.request_timeout())
        .build()
        .context("building http client")?;
    let loader = OnnxLoader::new(client, cfg.model_base_url.clone(), cfg.model_dir())
        .with_thresholds(cfg.detector_score_threshold, cfg.nms_threshold);
    Ok(EmbeddingProviderHandle::new(loader))
}

fn set_endpoint(mut cfg: Config, path: Option<&Path>, raw: &str) -> Result<()> {
    let endpoint = config::decode_endpoint(raw);
    RemoteClient::new(reqwest::Client::new(), &endpoint)
        .with_context(|| format!("{endpoint:?} is not a usable endpoint"))?;
    cfg.endpoint = Some(endpoint.clone());
    config::save_config(&cfg, path)?;
    info!("✓ Endpoint set to {}", endpoint);
    Ok(())
}

async fn list(cfg: &Config, folder: Option<&str>) -> Result<()> {
    let listing = remote(cfg)?
        .list(folder)
        .await
        .context("Failed to list gallery")?;

    for f in &listing.folders {
        println!("[folder] {}\t{}", f.id, f.name);
    }
    for f in &listing.files {
        println!("{}\t{}", f.id, f.name);
    }
    info!(
        "{} files, {} folders",
        listing.files.len(),
        listing.folders.len()
    );
    Ok(())
}

async fn index(cfg: &Config, folder: Option<&str>, fresh: bool) -> Result<()> {
    let remote = remote(cfg)?;
    let listing = remote
        .list(folder)
        .await
        .context("Failed to list gallery")?;

    let mut store = match remote.load_store_or_empty().await {
        StoreState::Unavailable if !fresh => {
            anyhow::bail!(
                "Existing embedding store could not be loaded; refusing to overwrite it. \
                 Pass --fresh to rebuild from scratch."
            );
        }
        state => state.into_store(),
    };
    info!(
        "Gallery has {} files, store has {} records",
        listing.files.len(),
        store.len()
    );

    if indexer::pending_files(&listing.files, &store).is_empty() {
        info!("✓ Nothing new to index");
        return Ok(());
    }

    let handle = provider_handle(cfg)?;
    let provider = handle.ensure_ready().await?;

    let mut fetcher = ImageFetcher::new(http_client(cfg)?, cfg.image_variant);
    if let Some(proxy) = &cfg.image_proxy {
        fetcher = fetcher.with_proxy(proxy, cfg.proxy_width)?;
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current batch...");
            on_ctrl_c.cancel();
        }
    });

    let options = cfg.index_options();
    let indexer = Indexer::new(&fetcher, provider.as_ref(), options);
    let report = indexer
        .run(&listing.files, &mut store, Some(&remote), &cancel)
        .await;

    info!(
        "{} {} new image(s), {} without faces, {} failed; store now {} records / {} faces",
        if report.cancelled { "Stopped:" } else { "✓ Done:" },
        report.indexed,
        report.no_face,
        report.failed,
        store.len(),
        store.face_count()
    );

    if report.save_failures > 0 {
        anyhow::bail!(
            "{} save(s) of the embedding store failed; rerun index to retry",
            report.save_failures
        );
    }
    Ok(())
}

async fn search(cfg: &Config, photo: &Path, matcher: &Matcher, folder: Option<&str>) -> Result<()> {
    let remote = remote(cfg)?;
    let state = remote.load_store_or_empty().await;
    match &state {
        StoreState::Unavailable => {
            warn!("Face search unavailable: the embedding store could not be loaded.");
            return Ok(());
        }
        StoreState::Empty => {
            warn!("No faces indexed yet. Run 'index' first.");
            return Ok(());
        }
        StoreState::Ready(_) => {}
    }

    let img = image::open(photo).with_context(|| format!("opening {}", photo.display()))?;
    let handle = provider_handle(cfg)?;
    let provider = handle.ensure_ready().await?;

    let matches = match search::search(provider.as_ref(), &state, matcher, img).await? {
        SearchOutcome::StoreNotBuilt => {
            warn!("No faces indexed yet. Run 'index' first.");
            return Ok(());
        }
        SearchOutcome::NoFaceInQuery => {
            anyhow::bail!("No face found in {}. Try a clearer photo.", photo.display());
        }
        SearchOutcome::Matches(matches) => matches,
    };

    if matches.is_empty() {
        info!("No matching photos (threshold {:.2})", matcher.threshold());
        return Ok(());
    }

    let listing = match remote.list(folder).await {
        Ok(listing) => listing,
        Err(e) => {
            // ids alone are still a usable answer
            warn!("Could not fetch the gallery listing: {}", e);
            let mut ids: Vec<&String> = matches.iter().collect();
            ids.sort();
            for id in ids {
                println!("{}", id);
            }
            info!("✓ {} matching photo(s)", matches.len());
            return Ok(());
        }
    };

    let scoped = search::in_listing(&matches, &listing.files);
    for f in &scoped.files {
        println!("{}\t{}", f.id, f.name);
    }
    let place = if folder.is_some() { "this folder" } else { "the gallery" };
    if scoped.files.is_empty() {
        info!("No matching photos in {}", place);
    } else {
        info!("✓ {} matching photo(s)", scoped.files.len());
    }
    if scoped.outside > 0 {
        info!("{} more match(es) outside {}", scoped.outside, place);
    }
    Ok(())
}

async fn status(cfg: &Config) -> Result<()> {
    let remote = remote(cfg)?;
    match remote.load_store_or_empty().await {
        StoreState::Unavailable => info!("Embedding store: unavailable (search disabled)"),
        StoreState::Empty => info!("Embedding store: empty, run 'index' to build it"),
        StoreState::Ready(store) => info!(
            "Embedding store: {} images, {} faces",
            store.len(),
            store.face_count()
        ),
    }
    info!("Match threshold: {:.2}", cfg.threshold);
    info!("Model cache: {}", cfg.model_dir().display());
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&Config::default(), Some(config_path))?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
