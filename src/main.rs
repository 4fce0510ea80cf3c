//! clt-latents CLI: per-residue cross-layer transcoder latents

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clt_latents::postprocess::DEFAULT_TOP_N;
use clt_latents::{
    archive_events, top_activations, DeviceChoice, Experiment, ExtractionConfig, FeatureNodes,
    LatentArchive,
};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "clt-latents")]
#[command(about = "Per-residue cross-layer transcoder latents for ESM-2")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract latent archives for member / non-member groups of each target family
    Extract(ExtractArgs),
    /// Print the fields and per-element shapes of an archive
    Inspect {
        /// Archive written by `extract`
        archive: PathBuf,
    },
    /// Flatten selected latents of every archived sequence into event rows
    Events {
        /// Archive written by `extract`
        #[arg(short, long)]
        archive: PathBuf,
        /// Feature-node JSON ({"family", "nodes": {layer: [latents]}})
        #[arg(short, long)]
        nodes: PathBuf,
        #[arg(short, long, default_value = "events.json")]
        output: PathBuf,
    },
    /// Find the top-activating sequences of selected latents
    Top {
        /// Archive written by `extract`
        #[arg(short, long)]
        archive: PathBuf,
        /// Feature-node JSON ({"family", "nodes": {layer: [latents]}})
        #[arg(short, long)]
        nodes: PathBuf,
        /// Examples kept per latent
        #[arg(long, default_value_t = DEFAULT_TOP_N)]
        top_n: usize,
        #[arg(short, long, default_value = "top_activations.json")]
        output: PathBuf,
    },
}

#[derive(clap::Args)]
struct ExtractArgs {
    /// CLT safetensors checkpoint
    #[arg(long)]
    clt_checkpoint: PathBuf,

    /// ESM-2 weights: local file, local directory or HuggingFace repo id
    /// (e.g., "facebook/esm2_t6_8M_UR50D")
    #[arg(long)]
    encoder_weights: String,

    /// Protein table (.parquet, or JSON) with Entry, Sequence and InterPro columns
    #[arg(long)]
    dataset: PathBuf,

    /// Output directory for archives
    #[arg(short, long, default_value = "activations_output")]
    output_dir: PathBuf,

    /// Sequences sampled per group
    #[arg(long, default_value_t = 50)]
    n_samples: usize,

    /// Sequences per encoder batch
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Sampling seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Target InterPro families (repeatable)
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Compute device
    #[arg(long, value_enum, default_value_t = DeviceChoice::Auto)]
    device: DeviceChoice,

    /// Layers to extract (default: every CLT layer)
    #[arg(long)]
    n_layers: Option<usize>,

    /// Top-k override (default: checkpoint metadata)
    #[arg(long)]
    k: Option<usize>,

    /// Hide padding tokens from encoder self-attention
    #[arg(long)]
    mask_padding: bool,
}

impl ExtractArgs {
    fn into_config(self) -> ExtractionConfig {
        let mut config =
            ExtractionConfig::new(self.clt_checkpoint, self.encoder_weights, self.dataset);
        config.output_dir = self.output_dir;
        config.n_samples = self.n_samples;
        config.batch_size = self.batch_size;
        config.seed = self.seed;
        if !self.targets.is_empty() {
            config.targets = self.targets;
        }
        config.device = self.device;
        config.n_layers = self.n_layers;
        config.k = self.k;
        config.mask_padding_in_attention = self.mask_padding;
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Extract(args) => run_extract(args.into_config()),
        Command::Inspect { archive } => run_inspect(&archive),
        Command::Events {
            archive,
            nodes,
            output,
        } => run_events(&archive, &nodes, &output),
        Command::Top {
            archive,
            nodes,
            top_n,
            output,
        } => run_top(&archive, &nodes, top_n, &output),
    }
}

fn run_extract(config: ExtractionConfig) -> Result<()> {
    println!("=== clt-latents: CLT latent extraction ===");
    println!("CLT:     {}", config.clt_checkpoint.display());
    println!("Encoder: {}", config.encoder_weights);
    println!("Dataset: {}", config.dataset_path.display());
    println!("Output:  {}", config.output_dir.display());
    println!("Targets: {}", config.targets.join(", "));

    let output_dir = config.output_dir.clone();
    let report = Experiment::new(config).run()?;

    println!("\n=== Results ===");
    for target in &report.targets {
        if target.is_skipped() {
            println!("{}: skipped (no matching sequences)", target.target);
        } else {
            println!(
                "{}: {} members, {} non-members",
                target.target, target.n_members, target.n_non_members
            );
        }
    }
    println!(
        "\n{} archives written ({} layers, k = {})",
        report.n_archives(),
        report.n_layers,
        report.k
    );

    let summary_path = output_dir.join("extraction_summary.json");
    std::fs::write(&summary_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("Failed to write {}", summary_path.display()))?;
    info!("Summary saved to {}", summary_path.display());

    Ok(())
}

fn run_inspect(path: &Path) -> Result<()> {
    let archive = LatentArchive::read(path)?;

    println!("=== {} ===", path.display());
    println!("Fields: activations, entries, sequences");
    println!("activations: {} arrays", archive.activations().len());
    println!("entries:     {}", archive.entries().len());
    println!("sequences:   {}", archive.sequences().len());

    if !archive.is_empty() {
        println!("\n{:<16} {:>8}  shape", "entry", "length");
        for ((entry, seq), shape) in archive
            .entries()
            .iter()
            .zip(archive.sequences())
            .zip(archive.activations().shapes())
        {
            println!("{:<16} {:>8}  {:?}", entry, seq.chars().count(), shape);
        }
    }
    Ok(())
}

fn run_events(archive_path: &Path, nodes_path: &Path, output: &Path) -> Result<()> {
    let archive = LatentArchive::read(archive_path)?;
    let nodes = FeatureNodes::load(nodes_path)?;
    info!(
        "Collecting events for {} latents over {} sequences",
        nodes.features()?.len(),
        archive.len()
    );

    let events = archive_events(&archive, &nodes)?;
    let total: usize = events.iter().map(|s| s.events.len()).sum();

    std::fs::write(output, serde_json::to_string_pretty(&events)?)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("{total} events saved to {}", output.display());
    Ok(())
}

fn run_top(archive_path: &Path, nodes_path: &Path, top_n: usize, output: &Path) -> Result<()> {
    let archive = LatentArchive::read(archive_path)?;
    let nodes = FeatureNodes::load(nodes_path)?;
    info!(
        "Ranking {} sequences for {} latents of {}",
        archive.len(),
        nodes.features()?.len(),
        nodes.family
    );

    let top = top_activations(&archive, &nodes, top_n)?;

    std::fs::write(output, serde_json::to_string_pretty(&top)?)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Saved to {}", output.display());
    Ok(())
}
