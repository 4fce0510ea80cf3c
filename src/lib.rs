// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `b_pre`/`b_enc`
#![allow(clippy::module_name_repetitions)] // EsmConfig in forward_esm.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! clt-latents: per-residue cross-layer transcoder latents
//!
//! Runs an ESM-2 protein language model layer by layer, recomputes the
//! sparse latents of a cross-layer transcoder (CLT) from each layer's
//! hidden states, and stores one `(n_layers, L, d_hidden)` array per
//! sequence in ragged archives, split by membership in a target family.
//!
//! ## Architecture
//!
//! - `alphabet`: ESM-2 vocabulary and marker-bracketed batch conversion
//! - `masks`: Padding mask and additive key padding bias
//! - `model`: `ProteinEncoder` contract, device selection, weight resolution
//! - `forward_esm`: ESM-2 forward pass exposing each layer
//! - `clt`: CLT checkpoint loading, encode path and top-k sparsification
//! - `batch`: Order-preserving fixed-size batching
//! - `cache`: Per-batch layer latents and per-sequence reassembly
//! - `extract`: Layer-wise latent extraction over batches
//! - `archive`: Ragged latent collections and compressed archives
//! - `dataset`: Protein table loading, family split and seeded sampling
//! - `experiment`: Extraction runner coordinating the full pipeline
//! - `postprocess`: Event lists and top-activating examples per latent

pub mod alphabet;
pub mod archive;
pub mod batch;
pub mod cache;
pub mod clt;
pub mod dataset;
pub mod experiment;
pub mod extract;
pub mod forward_esm;
pub mod masks;
pub mod model;
pub mod postprocess;

pub use alphabet::{EsmAlphabet, TokenBatch};
pub use archive::{archive_file_name, Group, LatentArchive, RaggedActivations};
pub use batch::partition;
pub use cache::LayerLatents;
pub use clt::{top_k_sparsify, CltConfig, CltFeatureId, CrossLayerTranscoder};
pub use dataset::{FamilySplit, ProteinTable, SequenceSample};
pub use experiment::{
    Experiment, ExtractionConfig, ExtractionReport, GroupReport, TargetOutcome, TargetReport,
};
pub use extract::{ExtractionOptions, LatentExtractor};
pub use forward_esm::{EsmConfig, EsmEncoder};
pub use masks::{create_key_padding_bias, create_padding_mask};
pub use model::{select_device, DeviceChoice, ProteinEncoder};
pub use postprocess::{
    archive_events, latent_events, top_activations, FeatureNodes, LatentEvent, SequenceEvents,
    TopActivations, TopExample,
};
