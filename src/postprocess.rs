//! Downstream consumers of latent archives
//!
//! Both consumers are driven by a feature-node file naming, per layer, the
//! latents of interest for one family:
//!
//! ```json
//! {"family": "IPR001478", "nodes": {"0": [12, 4031], "3": [77]}}
//! ```
//!
//! - [`latent_events`] flattens one sequence's array into sparse
//!   `[layer, position, value, latent]` rows.
//! - [`top_activations`] ranks the sequences of an archive by their peak
//!   value on each selected latent.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize, Serializer};

use crate::archive::LatentArchive;
use crate::clt::CltFeatureId;

/// Default number of examples kept per latent.
pub const DEFAULT_TOP_N: usize = 10;

/// Selected latents per layer for one family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureNodes {
    pub family: String,
    /// Layer index (as a string key) → latent indices
    pub nodes: BTreeMap<String, Vec<usize>>,
}

impl FeatureNodes {
    /// Load a feature-node JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read feature nodes {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse feature nodes {}", path.display()))
    }

    /// `(layer, latents)` pairs sorted by numeric layer.
    pub fn layers(&self) -> Result<Vec<(usize, &[usize])>> {
        let mut layers = self
            .nodes
            .iter()
            .map(|(key, latents)| {
                let layer: usize = key
                    .parse()
                    .with_context(|| format!("Invalid layer key '{key}' in feature nodes"))?;
                Ok((layer, latents.as_slice()))
            })
            .collect::<Result<Vec<_>>>()?;
        layers.sort_by_key(|(layer, _)| *layer);
        Ok(layers)
    }

    /// Every selected latent as a feature id, in layer then node order.
    pub fn features(&self) -> Result<Vec<CltFeatureId>> {
        Ok(self
            .layers()?
            .into_iter()
            .flat_map(|(layer, latents)| {
                latents
                    .iter()
                    .map(move |&index| CltFeatureId { layer, index })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Event lists
// ---------------------------------------------------------------------------

/// One nonzero selected latent at one residue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatentEvent {
    pub layer: usize,
    pub position: usize,
    pub value: f32,
    pub latent: usize,
}

impl Serialize for LatentEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (self.layer, self.position, self.value, self.latent).serialize(serializer)
    }
}

/// Nonzero values of the selected latents in one `(n_layers, L, d_hidden)` array.
///
/// Rows are ordered by layer, then position, then the node list order.
pub fn latent_events(activation: &Tensor, nodes: &FeatureNodes) -> Result<Vec<LatentEvent>> {
    let (n_layers, _, d_hidden) = activation.dims3()?;
    let mut events = Vec::new();

    for (layer, latents) in nodes.layers()? {
        anyhow::ensure!(
            layer < n_layers,
            "Feature nodes reference layer {layer} but the array has {n_layers} layers"
        );
        if let Some(&bad) = latents.iter().find(|&&l| l >= d_hidden) {
            anyhow::bail!("Latent {bad} out of range (d_hidden = {d_hidden})");
        }

        let rows: Vec<Vec<f32>> = activation.get(layer)?.to_vec2()?;
        for (position, row) in rows.iter().enumerate() {
            for &latent in latents {
                let value = row[latent];
                if value.abs() > 0.0 {
                    events.push(LatentEvent {
                        layer,
                        position,
                        value,
                        latent,
                    });
                }
            }
        }
    }
    Ok(events)
}

/// Events of every sequence in an archive
#[derive(Debug, Clone, Serialize)]
pub struct SequenceEvents {
    pub entry: String,
    pub sequence: String,
    pub events: Vec<LatentEvent>,
}

/// Run [`latent_events`] over every sequence of an archive, in archive order.
pub fn archive_events(archive: &LatentArchive, nodes: &FeatureNodes) -> Result<Vec<SequenceEvents>> {
    archive
        .activations()
        .iter()
        .zip(archive.entries().iter().zip(archive.sequences()))
        .map(|(activation, (entry, sequence))| {
            Ok(SequenceEvents {
                entry: entry.clone(),
                sequence: sequence.clone(),
                events: latent_events(activation, nodes)
                    .with_context(|| format!("Failed to collect events for {entry}"))?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Top-activating examples
// ---------------------------------------------------------------------------

/// One sequence's response to a latent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopExample {
    pub entry: String,
    /// Index of the sequence in the archive
    pub sequence_index: usize,
    pub peak_value: f32,
    /// Residue position (0-based) of the peak
    pub peak_position: usize,
    /// Latent value at every residue
    pub trace: Vec<f32>,
}

/// Top examples per selected latent: `layers[layer][latent]`
#[derive(Debug, Clone, Serialize)]
pub struct TopActivations {
    pub family: String,
    pub layers: BTreeMap<String, BTreeMap<String, Vec<TopExample>>>,
}

impl TopActivations {
    pub fn get(&self, feature: CltFeatureId) -> Option<&[TopExample]> {
        self.layers
            .get(&feature.layer.to_string())?
            .get(&feature.index.to_string())
            .map(Vec::as_slice)
    }
}

/// For each selected `(layer, latent)`, the `top_n` sequences with the highest peak.
///
/// Ties keep archive order. Sequences with no residues are ignored.
pub fn top_activations(
    archive: &LatentArchive,
    nodes: &FeatureNodes,
    top_n: usize,
) -> Result<TopActivations> {
    let mut layers = BTreeMap::new();

    for (layer, latents) in nodes.layers()? {
        let mut candidates: Vec<Vec<TopExample>> = vec![Vec::new(); latents.len()];

        for (i, activation) in archive.activations().iter().enumerate() {
            let (n_layers, len, d_hidden) = activation.dims3()?;
            anyhow::ensure!(
                layer < n_layers,
                "Feature nodes reference layer {layer} but the archive has {n_layers} layers"
            );
            if len == 0 {
                continue;
            }
            let rows: Vec<Vec<f32>> = activation.get(layer)?.to_vec2()?;

            for (slot, &latent) in latents.iter().enumerate() {
                anyhow::ensure!(
                    latent < d_hidden,
                    "Latent {latent} out of range (d_hidden = {d_hidden})"
                );
                let trace: Vec<f32> = rows.iter().map(|row| row[latent]).collect();
                let (peak_position, peak_value) = trace
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (p, v)| {
                        if v > best.1 {
                            (p, v)
                        } else {
                            best
                        }
                    });
                candidates[slot].push(TopExample {
                    entry: archive.entries()[i].clone(),
                    sequence_index: i,
                    peak_value,
                    peak_position,
                    trace,
                });
            }
        }

        let per_latent: BTreeMap<String, Vec<TopExample>> = latents
            .iter()
            .zip(candidates)
            .map(|(latent, mut examples)| {
                examples.sort_by(|a, b| b.peak_value.total_cmp(&a.peak_value));
                examples.truncate(top_n);
                (latent.to_string(), examples)
            })
            .collect();
        layers.insert(layer.to_string(), per_latent);
    }

    Ok(TopActivations {
        family: nodes.family.clone(),
        layers,
    })
}
