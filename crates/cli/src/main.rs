use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobs::PreviewSettings;
use media_io::location_from_uri;
use preview_cache::{hash_file, ContentDigest, PreviewCaches};
use timeline::{ClockTime, SECOND};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "previewctl", version, about = "Inspect and maintain the timeline preview caches")]
struct Cli {
    /// Settings file; defaults to the per-user one.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Cache root overriding the settings.
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the content digest naming a source's previews.
    Hash {
        /// File path or file:// URI.
        source: String,
    },
    /// Thumbnail store of one source.
    Thumbs {
        #[command(subcommand)]
        action: ThumbsAction,
    },
    /// Waveform of one source.
    Waves {
        #[command(subcommand)]
        action: WavesAction,
    },
    /// Share the previews of `original` with a proxy.
    Alias { original: String, proxy: String },
    /// Print the effective settings as JSON.
    Settings,
}

#[derive(Subcommand, Debug)]
enum ThumbsAction {
    /// Entry count, geometry and covered range.
    Info { digest: String },
    /// Write one thumbnail as JPEG, the middle one unless `--time` is given.
    Export {
        digest: String,
        output: PathBuf,
        /// Offset in nanoseconds.
        #[arg(long)]
        time: Option<ClockTime>,
    },
}

#[derive(Subcommand, Debug)]
enum WavesAction {
    /// Summary of the stored amplitudes, or all of them with `--json`.
    Dump {
        digest: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    let mut settings = match &cli.settings {
        Some(path) => PreviewSettings::load(path).with_context(|| format!("reading settings {}", path.display()))?,
        None => PreviewSettings::load_or_default(),
    };
    if let Some(root) = cli.cache_root {
        settings.cache_root = Some(root);
    }

    match cli.command {
        Commands::Hash { source } => hash(&source),
        Commands::Thumbs { action } => thumbs(&settings, action),
        Commands::Waves { action } => waves(&settings, action),
        Commands::Alias { original, proxy } => alias(&settings, &original, &proxy),
        Commands::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn open_caches(settings: &PreviewSettings) -> Result<PreviewCaches> {
    let dirs = settings.cache_dirs().context("locating the cache directory")?;
    debug!(thumbs = %dirs.thumbs.display(), waves = %dirs.waves.display(), "opening preview caches");
    PreviewCaches::new(dirs, settings.jpeg_quality).context("opening the preview caches")
}

fn hash(source: &str) -> Result<()> {
    let path = if source.starts_with("file://") { location_from_uri(source)? } else { PathBuf::from(source) };
    let digest = hash_file(&path).with_context(|| format!("hashing {}", path.display()))?;
    println!("{digest}");
    Ok(())
}

fn seconds(time: ClockTime) -> f64 { time as f64 / SECOND as f64 }

fn thumbs(settings: &PreviewSettings, action: ThumbsAction) -> Result<()> {
    let mut caches = open_caches(settings)?;
    let digest = match &action {
        ThumbsAction::Info { digest } | ThumbsAction::Export { digest, .. } => ContentDigest::new(digest.as_str()),
    };
    let db = caches.dirs().thumbs.join(digest.as_str());
    if !db.exists() {
        bail!("no thumbnails for {digest} in {}", caches.dirs().thumbs.display());
    }
    let cache = caches.thumbnails(&digest)?;
    let cache = cache.borrow();

    match action {
        ThumbsAction::Info { .. } => {
            let times = cache.times()?;
            println!("store:      {}", cache.path().display());
            println!("thumbnails: {}", times.len());
            if let Some((width, height)) = cache.image_dimensions()? {
                println!("size:       {width}x{height}");
            }
            if let (Some(first), Some(last)) = (times.first(), times.last()) {
                println!("range:      {:.2}s - {:.2}s", seconds(*first), seconds(*last));
            }
        }
        ThumbsAction::Export { output, time, .. } => {
            let time = match time {
                Some(time) => time,
                None => match cache.preview_entry()? {
                    Some((time, _)) => time,
                    None => bail!("thumbnail store for {digest} is empty"),
                },
            };
            let jpeg = cache.read_jpeg(time).with_context(|| format!("reading thumbnail at {time}ns"))?;
            write_output(&output, &jpeg)?;
            println!("wrote {:.2}s to {}", seconds(time), output.display());
        }
    }
    Ok(())
}

fn waves(settings: &PreviewSettings, action: WavesAction) -> Result<()> {
    let caches = open_caches(settings)?;
    let WavesAction::Dump { digest, json } = action;
    let digest = ContentDigest::new(digest);
    let store = caches.waveforms();
    if !store.exists(&digest) {
        bail!("no waveform for {digest} in {}", store.dir().display());
    }
    let samples = store.load(&digest)?;
    if json {
        println!("{}", serde_json::to_string(&samples)?);
        return Ok(());
    }
    let peak = samples.iter().copied().fold(0.0_f64, f64::max);
    let mean = if samples.is_empty() { 0.0 } else { samples.iter().sum::<f64>() / samples.len() as f64 };
    let covered = seconds(samples.len() as ClockTime * settings.sample_duration_ns);
    println!("file:    {}", store.path_for(&digest).display());
    println!("samples: {} ({covered:.2}s)", samples.len());
    println!("peak:    {peak:.1}%");
    println!("mean:    {mean:.1}%");
    Ok(())
}

fn alias(settings: &PreviewSettings, original: &str, proxy: &str) -> Result<()> {
    let mut caches = open_caches(settings)?;
    let (original, proxy) = (ContentDigest::new(original), ContentDigest::new(proxy));
    caches.alias_proxy(&original, &proxy).with_context(|| format!("aliasing {original} to {proxy}"))?;
    println!("{proxy} -> {original}");
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}
