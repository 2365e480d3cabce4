use anyhow::{Context, Result};
use bookdedup::config::Config;
use bookdedup::core::archive::{ArchiveSource, DirectoryArchive};
use bookdedup::core::duplicate::ImageComparer;
use bookdedup::core::hash::hamming_distance;
use bookdedup::core::index::DedupIndex;
use bookdedup::core::metadata::{InMemoryMetadata, MetadataProvider, NoMetadata};
use bookdedup::core::models::ImageFingerprint;
use bookdedup::core::resolver::MetadataAwareResolver;
use bookdedup::core::scanner::{FingerprintBundle, FingerprintPipeline};
use bookdedup::core::store::{DirectoryWriterFactory, read_document};
use bookdedup::progress::{BarProgress, ProgressSink};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use env_logger::{Builder, Env};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "bookdedup", version, about = "Fingerprint and deduplicate e-book archives")]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: <config dir>/bookdedup/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fingerprint archives and write one index document per archive
    Hash {
        /// Directories of .fb2 files, one per archive
        #[arg(required = true, value_name = "DIR")]
        archives: Vec<PathBuf>,

        /// Where index documents are written
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,

        /// Index documents from earlier runs (default: the output directory)
        #[arg(long, value_name = "DIR")]
        index: Option<PathBuf>,

        /// JSON list of {folder, file, title, deleted} records
        #[arg(long, value_name = "FILE")]
        metadata: Option<PathBuf>,

        /// Maximum worker threads
        #[arg(long)]
        threads: Option<usize>,

        /// Library name recorded in index documents
        #[arg(long)]
        library: Option<String>,

        /// Hamming distance up to which two images match
        #[arg(long)]
        threshold: Option<u32>,

        /// Compute perceptual hashes after the merge, for unique books only
        #[arg(long)]
        defer: bool,

        /// Overwrite existing index documents without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Compare books against the first one
    Compare {
        #[arg(num_args = 2.., required = true, value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Hamming distance up to which two images match
        #[arg(long)]
        threshold: Option<u32>,
    },

    /// Print the records of an index document as JSON
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(level)).init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    match cli.command {
        Commands::Hash {
            archives,
            output,
            index,
            metadata,
            threads,
            library,
            threshold,
            defer,
            yes,
        } => {
            if let Some(threads) = threads {
                config.max_workers = threads.max(1);
            }
            if let Some(library) = library {
                config.source_library = library;
            }
            if let Some(threshold) = threshold {
                config.hamming_threshold = threshold;
            }
            config.defer_perceptual |= defer;
            config.validate()?;

            let metadata: Arc<dyn MetadataProvider> = match metadata {
                Some(path) => Arc::new(InMemoryMetadata::load(&path)?),
                None => Arc::new(NoMetadata),
            };
            run_hash(&config, &archives, &output, index.as_deref(), metadata, yes)?;
        }

        Commands::Compare { files, threshold } => {
            if let Some(threshold) = threshold {
                config.hamming_threshold = threshold;
            }
            run_compare(&config, &files)?;
        }

        Commands::Inspect { file } => {
            let document = read_document(&file)
                .with_context(|| format!("Failed to read index document {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }

    Ok(())
}

fn run_hash(
    config: &Config,
    archives: &[PathBuf],
    output: &Path,
    index_dir: Option<&Path>,
    metadata: Arc<dyn MetadataProvider>,
    yes: bool,
) -> Result<()> {
    fs::create_dir_all(output)
        .with_context(|| format!("Failed to create output directory {}", output.display()))?;

    let mut index = DedupIndex::from_config(config)
        .with_metadata(metadata.clone())
        .with_resolver(Box::new(MetadataAwareResolver::new(metadata.clone())));

    let index_dir = index_dir.unwrap_or(output);
    if index_dir.is_dir() {
        index
            .load_dir(index_dir)
            .with_context(|| format!("Failed to load index from {}", index_dir.display()))?;
    }

    let writers = DirectoryWriterFactory::new(output, &config.source_library);
    let started = Instant::now();

    for path in archives {
        let archive = DirectoryArchive::open(path)
            .with_context(|| format!("Failed to open archive {}", path.display()))?;
        let batch_id = archive.folder().to_string();

        let target = writers.path_for(&batch_id);
        if target.exists() && !yes {
            let overwrite = Confirm::new()
                .with_prompt(format!("{} exists, overwrite?", target.display()))
                .default(false)
                .interact()?;
            if !overwrite {
                println!("⏭️  Skipping {}", path.display());
                continue;
            }
        }

        let total = archive.files()?.len() as u64;
        let progress = Arc::new(BarProgress::new(total));
        let pipeline = FingerprintPipeline::new(config)
            .with_progress(progress.clone())
            .with_metadata(metadata.clone());

        println!("▶ Fingerprinting {} ({} files)", path.display(), total);
        let report = pipeline.run(&archive, &mut index)?;
        progress.finish();

        let written = index
            .save(&batch_id, &writers)
            .with_context(|| format!("Failed to write index for {}", batch_id))?;

        println!(
            "   ✅ {} processed, {} unique, {} duplicates, {} failed, {} records written",
            report.processed,
            report.accepted,
            report.rejected,
            report.failed.len(),
            written
        );
        for failed in &report.failed {
            println!("   ⚠️  {}: {}", failed.uid, failed.reason);
        }
    }

    println!(
        "\n✅ Finished at {} in {:.1?}",
        Utc::now().to_rfc3339(),
        started.elapsed()
    );
    Ok(())
}

fn run_compare(config: &Config, files: &[PathBuf]) -> Result<()> {
    let pipeline = FingerprintPipeline::new(&Config {
        defer_perceptual: false,
        ..config.clone()
    });

    let bundles: Vec<FingerprintBundle> = files
        .par_iter()
        .map(|path| -> Result<FingerprintBundle> {
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("Not a file: {}", path.display()))?;
            let archive = DirectoryArchive::open(parent)?;
            let payload = archive
                .read(&name)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(pipeline.fingerprint_payload(payload))
        })
        .collect::<Result<_>>()?;

    let comparer = ImageComparer::new(config.hamming_threshold);
    let mut entries = Vec::new();
    for bundle in bundles {
        let uid = bundle.uid.clone();
        let top_words = bundle
            .text
            .as_ref()
            .map(|text| text.top_words.iter().map(|(_, w)| w.clone()).collect::<BTreeSet<_>>())
            .unwrap_or_default();
        let (_, entry) = bundle
            .into_entry()
            .map_err(|failed| anyhow::anyhow!("{}: {}", failed.uid, failed.reason))
            .with_context(|| format!("Cannot fingerprint {}", uid))?;
        entries.push((entry, top_words));
    }

    let (reference, reference_words) = &entries[0];
    println!("🔍 Reference: {} [{}]", reference.uid, reference.content_hash);

    for (entry, words) in &entries[1..] {
        println!("\n▶ {} [{}]", entry.uid, entry.content_hash);
        if entry.content_hash == reference.content_hash {
            println!("   text: identical");
        } else {
            println!("   text: different");
            let missing: Vec<_> = reference_words.difference(words).collect();
            let extra: Vec<_> = words.difference(reference_words).collect();
            println!("     only in reference: {:?}", missing);
            println!("     only here:         {:?}", extra);
        }

        println!("   cover: {}", describe_cover(&reference.cover, &entry.cover));
        for image in &entry.images {
            match nearest(image, &reference.images) {
                Some((other, distance)) => println!(
                    "   image {} → {} (distance {})",
                    image.file_name, other.file_name, distance
                ),
                None => println!("   image {} → no counterpart", image.file_name),
            }
        }
        println!("   classification: {:?}", comparer.compare(reference, entry));
    }

    Ok(())
}

fn describe_cover(lhs: &ImageFingerprint, rhs: &ImageFingerprint) -> String {
    match (lhs.is_empty(), rhs.is_empty()) {
        (true, true) => "none".to_string(),
        (false, true) => "only in reference".to_string(),
        (true, false) => "only here".to_string(),
        (false, false) if lhs.crypto_hash == rhs.crypto_hash => "identical".to_string(),
        (false, false) => format!(
            "distance {}",
            hamming_distance(lhs.perceptual_hash, rhs.perceptual_hash)
        ),
    }
}

/// Closest image by perceptual hash; exact crypto matches count as distance 0
fn nearest<'a>(image: &ImageFingerprint, candidates: &'a [ImageFingerprint]) -> Option<(&'a ImageFingerprint, u32)> {
    candidates
        .iter()
        .map(|other| {
            let distance = if other.crypto_hash == image.crypto_hash {
                0
            } else {
                hamming_distance(other.perceptual_hash, image.perceptual_hash)
            };
            (other, distance)
        })
        .min_by_key(|(_, distance)| *distance)
}
