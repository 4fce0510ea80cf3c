//! Extraction runner for CLT latent archives
//!
//! Coordinates dataset loading, family splitting, sampling, latent
//! extraction and archive writing for every target family.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::archive::{archive_file_name, Group, LatentArchive};
use crate::batch::DEFAULT_BATCH_SIZE;
use crate::clt::CrossLayerTranscoder;
use crate::dataset::{ProteinTable, SequenceSample};
use crate::extract::{ExtractionOptions, LatentExtractor};
use crate::forward_esm::EsmEncoder;
use crate::model::{select_device, DeviceChoice, ProteinEncoder};

/// Target families processed when none are given.
pub const DEFAULT_TARGETS: [&str; 2] = ["IPR000786", "IPR011584"];

/// Configuration for an extraction run
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Transcoder safetensors checkpoint
    pub clt_checkpoint: PathBuf,
    /// Encoder weights: local file, local directory or HuggingFace repo id
    pub encoder_weights: String,
    /// Protein table (`.parquet` or JSON)
    pub dataset_path: PathBuf,
    /// Directory receiving the archives and the run summary
    pub output_dir: PathBuf,
    /// Sequences sampled per group
    pub n_samples: usize,
    /// Sequences per encoder batch
    pub batch_size: usize,
    /// Random seed for sampling
    pub seed: u64,
    /// InterPro identifiers to split on
    pub targets: Vec<String>,
    pub device: DeviceChoice,
    /// Layers to extract (None = every transcoder layer)
    pub n_layers: Option<usize>,
    /// Top-k override (None = checkpoint metadata)
    pub k: Option<usize>,
    /// Apply the key padding mask inside encoder self-attention
    pub mask_padding_in_attention: bool,
}

impl ExtractionConfig {
    /// Configuration with the three required inputs and defaults for the rest.
    pub fn new(
        clt_checkpoint: impl Into<PathBuf>,
        encoder_weights: impl Into<String>,
        dataset_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            clt_checkpoint: clt_checkpoint.into(),
            encoder_weights: encoder_weights.into(),
            dataset_path: dataset_path.into(),
            output_dir: PathBuf::from("activations_output"),
            n_samples: 50,
            batch_size: DEFAULT_BATCH_SIZE,
            seed: 42,
            targets: DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect(),
            device: DeviceChoice::Auto,
            n_layers: None,
            k: None,
            mask_padding_in_attention: false,
        }
    }
}

/// One written archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReport {
    pub group: Group,
    pub path: PathBuf,
    pub n_sequences: usize,
}

/// What happened to a target family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TargetOutcome {
    Written { archives: Vec<GroupReport> },
    Skipped { reason: String },
}

/// Per-target summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub target: String,
    pub n_members: usize,
    pub n_non_members: usize,
    #[serde(flatten)]
    pub outcome: TargetOutcome,
}

impl TargetReport {
    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, TargetOutcome::Skipped { .. })
    }
}

/// Results from a full extraction run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionReport {
    /// Layers extracted per sequence
    pub n_layers: usize,
    /// Nonzero latents kept per position
    pub k: usize,
    pub targets: Vec<TargetReport>,
}

impl ExtractionReport {
    /// Number of archives written across all targets
    pub fn n_archives(&self) -> usize {
        self.targets
            .iter()
            .map(|t| match &t.outcome {
                TargetOutcome::Written { archives } => archives.len(),
                TargetOutcome::Skipped { .. } => 0,
            })
            .sum()
    }
}

/// Main extraction runner
pub struct Experiment {
    config: ExtractionConfig,
}

impl Experiment {
    /// Create a new experiment
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Run the full pipeline: dataset, models, then every target.
    ///
    /// The dataset is loaded and validated before any model is touched.
    pub fn run(&self) -> Result<ExtractionReport> {
        info!("Starting latent extraction");
        info!("Config: {:?}", self.config);

        let table = ProteinTable::load(&self.config.dataset_path)?;
        info!("Loaded dataset: {} sequences", table.len());

        let device = select_device(self.config.device)?;

        let clt = CrossLayerTranscoder::open(&self.config.clt_checkpoint, &device)?;
        let clt = match self.config.k {
            Some(k) => clt.with_k(k),
            None => clt,
        };

        let encoder = EsmEncoder::load(&self.config.encoder_weights, &device, DType::F32)?;
        info!(
            "Encoder: {} layers, {} hidden",
            encoder.n_layers(),
            encoder.d_model()
        );

        self.run_with(&table, &encoder, &clt)
    }

    /// Run every target against already-loaded models.
    pub fn run_with<E: ProteinEncoder + ?Sized>(
        &self,
        table: &ProteinTable,
        encoder: &E,
        clt: &CrossLayerTranscoder,
    ) -> Result<ExtractionReport> {
        let mut options = ExtractionOptions::for_transcoder(clt)?;
        if let Some(n_layers) = self.config.n_layers {
            options.n_layers = n_layers;
        }
        options.batch_size = self.config.batch_size;
        options.mask_padding_in_attention = self.config.mask_padding_in_attention;

        let extractor = LatentExtractor::new(encoder, clt, options)?;
        info!(
            "Extracting {} layers with k = {}",
            extractor.effective_layers(),
            options.k
        );

        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                self.config.output_dir.display()
            )
        })?;

        let mut targets = Vec::with_capacity(self.config.targets.len());
        for target in &self.config.targets {
            info!("Processing target {target}");
            targets.push(self.run_target(table, &extractor, target)?);
        }

        Ok(ExtractionReport {
            n_layers: extractor.effective_layers(),
            k: options.k,
            targets,
        })
    }

    fn run_target<E: ProteinEncoder + ?Sized>(
        &self,
        table: &ProteinTable,
        extractor: &LatentExtractor<'_, E>,
        target: &str,
    ) -> Result<TargetReport> {
        let split = table.split_by_family(target);
        info!("Found {} sequences with {target}", split.members.len());
        info!("Found {} sequences without {target}", split.non_members.len());

        let mut report = TargetReport {
            target: target.to_string(),
            n_members: split.members.len(),
            n_non_members: split.non_members.len(),
            outcome: TargetOutcome::Skipped {
                reason: "no matching sequences".to_string(),
            },
        };
        if split.members.is_empty() {
            warn!("Skipping {target}: no matching sequences");
            return Ok(report);
        }

        let groups = [
            (
                Group::Positives,
                table.sample(&split.members, self.config.n_samples, self.config.seed),
            ),
            (
                Group::Negatives,
                table.sample(&split.non_members, self.config.n_samples, self.config.seed),
            ),
        ];

        let mut archives = Vec::with_capacity(groups.len());
        for (group, sample) in groups {
            archives.push(self.write_group(extractor, group, target, sample)?);
        }
        report.outcome = TargetOutcome::Written { archives };
        Ok(report)
    }

    fn write_group<E: ProteinEncoder + ?Sized>(
        &self,
        extractor: &LatentExtractor<'_, E>,
        group: Group,
        target: &str,
        sample: SequenceSample,
    ) -> Result<GroupReport> {
        info!("Processing {group} for {target} ({} sequences)", sample.len());

        let activations = extractor.extract(&sample.sequences)?;
        let archive = LatentArchive::new(activations, sample.entries, sample.sequences)?;

        let path = self
            .config
            .output_dir
            .join(archive_file_name(group, target));
        archive.write(&path)?;
        if let Some(first) = archive.activations().get(0) {
            info!("Example item shape: {:?} (layers, residues, hidden)", first.dims());
        }

        Ok(GroupReport {
            group,
            path,
            n_sequences: archive.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clt::tests::tiny_clt;
    use crate::forward_esm::tests::tiny_encoder;
    use std::collections::HashMap;

    fn table() -> ProteinTable {
        let col = |v: &[Option<&str>]| -> Vec<Option<String>> { v.iter().map(|s| s.map(str::to_string)).collect() };
        ProteinTable::from_columns(HashMap::from([
            (
                "Entry".to_string(),
                col(&[Some("P1"), Some("P2"), Some("P3"), Some("P4"), Some("P5")]),
            ),
            (
                "Sequence".to_string(),
                col(&[Some("MKVLA"), Some("MKVLAGSEQ"), Some("ACDEF"), Some("WW"), Some("GGGA")]),
            ),
            (
                "InterPro".to_string(),
                col(&[Some("IPR000786;"), None, Some("IPR000786;"), Some("IPR011584;"), None]),
            ),
        ]))
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ExtractionConfig::new("clt.safetensors", "facebook/esm2_t6_8M_UR50D", "data.json");
        assert_eq!(config.n_samples, 50);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.seed, 42);
        assert_eq!(config.targets, vec!["IPR000786", "IPR011584"]);
        assert_eq!(config.output_dir, PathBuf::from("activations_output"));
        assert_eq!(config.device, DeviceChoice::Auto);
        assert!(!config.mask_padding_in_attention);
    }

    #[test]
    fn test_run_with_writes_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ExtractionConfig::new("unused", "unused", "unused");
        config.output_dir = dir.path().join("out");
        config.targets = vec!["IPR000786".to_string(), "IPR999999".to_string()];
        config.batch_size = 2;

        let (encoder, _varmap) = tiny_encoder(2);
        let clt = tiny_clt(2, 8, 4, 2);
        let report = Experiment::new(config)
            .run_with(&table(), &encoder, &clt)
            .unwrap();

        assert_eq!(report.n_layers, 2);
        assert_eq!(report.k, 2);
        assert_eq!(report.targets.len(), 2);
        assert_eq!(report.n_archives(), 2);
        assert!(report.targets[1].is_skipped());
        assert_eq!(report.targets[0].n_members, 2);
        assert_eq!(report.targets[0].n_non_members, 3);

        let positives = LatentArchive::read(&dir.path().join("out/positives_IPR000786.safetensors.gz")).unwrap();
        assert_eq!(positives.len(), 2);
        for (array, seq) in positives.activations().iter().zip(positives.sequences()) {
            assert_eq!(array.dims(), &[2, seq.len(), 4]);
        }
        let negatives = LatentArchive::read(&dir.path().join("out/negatives_IPR000786.safetensors.gz")).unwrap();
        assert_eq!(negatives.len(), 3);
        assert!(!dir.path().join("out/positives_IPR999999.safetensors.gz").exists());
    }

    #[test]
    fn test_run_with_rejects_too_many_layers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ExtractionConfig::new("unused", "unused", "unused");
        config.output_dir = dir.path().to_path_buf();
        config.n_layers = Some(3);

        let (encoder, _varmap) = tiny_encoder(3);
        let clt = tiny_clt(2, 8, 4, 2);
        assert!(Experiment::new(config).run_with(&table(), &encoder, &clt).is_err());
    }

    #[test]
    fn test_report_serialization() {
        let report = TargetReport {
            target: "IPR000786".to_string(),
            n_members: 0,
            n_non_members: 4,
            outcome: TargetOutcome::Skipped {
                reason: "no matching sequences".to_string(),
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["n_non_members"], 4);
    }
}
