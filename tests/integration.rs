//! Integration tests for clt-latents
//!
//! End-to-end runs use tiny randomly initialized models. Datasets are
//! written as JSON or parquet fixtures. The pretrained
//! ESM-2 test runs only when `facebook/esm2_t6_8M_UR50D` is already in the
//! local HuggingFace cache, and skips with a message otherwise.

use arrow::array::{ArrayRef, Int64Array, LargeStringArray, StringArray};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clt_latents::{
    archive_file_name, top_activations, CrossLayerTranscoder, EsmConfig, EsmEncoder, Experiment,
    ExtractionConfig, ExtractionOptions, FeatureNodes, Group, LatentArchive, LatentExtractor,
    ProteinEncoder, ProteinTable, TargetOutcome,
};
use hf_hub::{Repo, RepoType};
use parquet::arrow::ArrowWriter;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

const ESM_REPO: &str = "facebook/esm2_t6_8M_UR50D";

fn tiny_encoder(n_layers: usize) -> (EsmEncoder, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = EsmConfig {
        hidden_size: 8,
        num_hidden_layers: n_layers,
        num_attention_heads: 2,
        intermediate_size: 16,
        vocab_size: 33,
        layer_norm_eps: 1e-5,
        pad_token_id: 1,
        rope_theta: 10_000.0,
    };
    let encoder = EsmEncoder::from_varbuilder(vb, config, &Device::Cpu).unwrap();
    (encoder, varmap)
}

fn random_clt(n_layers: usize, d_model: usize, d_hidden: usize, k: Option<usize>) -> CrossLayerTranscoder {
    let device = Device::Cpu;
    let b_pre = Tensor::randn(0.0f32, 0.1, (n_layers, d_model), &device).unwrap();
    let b_enc = Tensor::randn(0.0f32, 0.1, (n_layers, d_hidden), &device).unwrap();
    let weights = (0..n_layers)
        .map(|_| Tensor::randn(0.0f32, 1.0, (d_hidden, d_model), &device).unwrap())
        .collect();
    CrossLayerTranscoder::from_tensors(&b_pre, weights, &b_enc, k).unwrap()
}

fn write_dataset(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{contents}").unwrap();
    file
}

const COLUMNAR_DATASET: &str = r#"{
    "Entry": ["P1", "P2", "P3", "P4", "P5", "P6"],
    "Sequence": ["MKVLA", "MKVLAGSEQ", "ACDEF", "WWGY", "MSTNPKPQRKTKRNTNRRPQDVKFPGG", "AG"],
    "InterPro": ["IPR000786;IPR036412;", null, "IPR000786;", "IPR011584;", null, "IPR000786;"]
}"#;

/// Test dataset loading in both JSON layouts
#[test]
fn test_dataset_layouts() {
    let columnar = write_dataset(COLUMNAR_DATASET);
    let table = ProteinTable::load(columnar.path()).unwrap();
    assert_eq!(table.len(), 6);
    let split = table.split_by_family("IPR000786");
    assert_eq!(split.members, vec![0, 2, 5]);
    assert_eq!(split.non_members, vec![1, 3, 4]);

    let records = write_dataset(
        r#"[
        {"Entry": "P1", "Sequence": "MKV", "InterPro": "IPR011584;"},
        {"Entry": "P2", "Sequence": "AG", "InterPro": null}
    ]"#,
    );
    let table = ProteinTable::load(records.path()).unwrap();
    assert_eq!(table.split_by_family("IPR011584").members, vec![0]);
}

fn write_parquet(columns: Vec<(&str, ArrayRef)>) -> NamedTempFile {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let batch =
        RecordBatch::try_new(schema.clone(), columns.into_iter().map(|(_, a)| a).collect()).unwrap();

    let file = tempfile::Builder::new().suffix(".parquet").tempfile().unwrap();
    let mut writer = ArrowWriter::try_new(file.reopen().unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    file
}

/// Parquet tables load like the Swiss-Prot export: extra columns, nulls, large strings
#[test]
fn test_parquet_dataset() {
    let file = write_parquet(vec![
        ("Entry", Arc::new(StringArray::from(vec!["P1", "P2", "P3", "P4"])) as ArrayRef),
        ("Length", Arc::new(Int64Array::from(vec![5, 2, 4, 9])) as ArrayRef),
        (
            "Sequence",
            Arc::new(LargeStringArray::from(vec!["MKVLA", "AG", "WWGY", "MKVLAGSEQ"])) as ArrayRef,
        ),
        (
            "InterPro",
            Arc::new(StringArray::from(vec![
                Some("IPR000786;IPR036412;"),
                None,
                Some("IPR011584;"),
                Some("IPR000786;"),
            ])) as ArrayRef,
        ),
    ]);
    assert_eq!(
        file.path().extension().and_then(|e| e.to_str()),
        Some("parquet")
    );

    let table = ProteinTable::load(file.path()).unwrap();
    assert_eq!(table.len(), 4);
    let split = table.split_by_family("IPR000786");
    assert_eq!(split.members, vec![0, 3]);
    assert_eq!(split.non_members, vec![1, 2]);

    let sample = table.sample(&split.members, 10, 42);
    let mut pairs: Vec<(String, String)> = sample.entries.into_iter().zip(sample.sequences).collect();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            ("P1".to_string(), "MKVLA".to_string()),
            ("P4".to_string(), "MKVLAGSEQ".to_string())
        ]
    );
}

/// A parquet table without InterPro fails before any model is loaded
#[test]
fn test_parquet_missing_family_column() {
    let file = write_parquet(vec![
        ("Entry", Arc::new(StringArray::from(vec!["P1"])) as ArrayRef),
        ("Sequence", Arc::new(StringArray::from(vec!["MKV"])) as ArrayRef),
    ]);
    let err = ProteinTable::load(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("InterPro"), "{err:#}");

    let dir = tempfile::tempdir().unwrap();
    let mut config = ExtractionConfig::new(
        dir.path().join("missing_clt.safetensors"),
        dir.path().join("missing_encoder").to_string_lossy().to_string(),
        file.path(),
    );
    config.output_dir = dir.path().join("out");
    let err = Experiment::new(config).run().unwrap_err();
    assert!(format!("{err:#}").contains("InterPro"), "{err:#}");
}

/// A dataset without the family column fails before any model is loaded
#[test]
fn test_missing_family_column_is_reported_first() {
    let dataset = write_dataset(r#"{"Entry": ["P1"], "Sequence": ["MKV"]}"#);
    let dir = tempfile::tempdir().unwrap();
    let mut config = ExtractionConfig::new(
        dir.path().join("missing_clt.safetensors"),
        dir.path().join("missing_encoder").to_string_lossy().to_string(),
        dataset.path(),
    );
    config.output_dir = dir.path().join("out");

    let err = Experiment::new(config).run().unwrap_err();
    assert!(format!("{err:#}").contains("InterPro"), "{err:#}");
    assert!(!dir.path().join("out").exists());
}

/// Full pipeline over a saved and reopened CLT checkpoint
#[test]
fn test_end_to_end_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let clt_path = dir.path().join("clt.safetensors");
    random_clt(2, 8, 16, Some(3)).save(&clt_path).unwrap();
    let clt = CrossLayerTranscoder::open(&clt_path, &Device::Cpu).unwrap();
    assert_eq!(clt.k().unwrap(), 3);

    let dataset = write_dataset(COLUMNAR_DATASET);
    let table = ProteinTable::load(dataset.path()).unwrap();
    let (encoder, _varmap) = tiny_encoder(2);

    let mut config = ExtractionConfig::new(&clt_path, "unused", dataset.path());
    config.output_dir = dir.path().join("out");
    config.targets = vec!["IPR000786".to_string(), "IPR424242".to_string(), "IPR011584".to_string()];
    config.n_samples = 2;
    config.batch_size = 2;

    let report = Experiment::new(config).run_with(&table, &encoder, &clt).unwrap();
    assert_eq!(report.n_layers, 2);
    assert_eq!(report.k, 3);
    assert_eq!(report.targets.len(), 3);
    assert_eq!(report.n_archives(), 4);
    assert!(report.targets[1].is_skipped());

    match &report.targets[0].outcome {
        TargetOutcome::Written { archives } => {
            assert_eq!(archives.len(), 2);
            assert_eq!(archives[0].group, Group::Positives);
            assert_eq!(archives[0].n_sequences, 2);
            assert_eq!(archives[1].n_sequences, 2);
        }
        TargetOutcome::Skipped { reason } => panic!("unexpected skip: {reason}"),
    }

    let out = dir.path().join("out");
    for target in ["IPR000786", "IPR011584"] {
        for group in [Group::Positives, Group::Negatives] {
            let archive = LatentArchive::read(&out.join(archive_file_name(group, target))).unwrap();
            assert_eq!(archive.activations().len(), archive.entries().len());
            for (array, seq) in archive.activations().iter().zip(archive.sequences()) {
                assert_eq!(array.dims(), &[2, seq.chars().count(), 16]);
            }
        }
    }
    // IPR011584 has one member; the positives group is clamped to it
    let positives = LatentArchive::read(&out.join("positives_IPR011584.safetensors.gz")).unwrap();
    assert_eq!(positives.entries(), &["P4".to_string()]);
    assert!(!out.join("positives_IPR424242.safetensors.gz").exists());

    let summary = serde_json::to_string(&report).unwrap();
    assert!(summary.contains("\"status\":\"skipped\""));
}

/// Sampling is seeded: two runs write identical archives
#[test]
fn test_runs_are_reproducible() {
    let dataset = write_dataset(COLUMNAR_DATASET);
    let table = ProteinTable::load(dataset.path()).unwrap();
    let (encoder, _varmap) = tiny_encoder(1);
    let clt = random_clt(1, 8, 6, Some(2));

    let run = |out: &std::path::Path| {
        let mut config = ExtractionConfig::new("unused", "unused", dataset.path());
        config.output_dir = out.to_path_buf();
        config.targets = vec!["IPR000786".to_string()];
        config.n_samples = 2;
        Experiment::new(config).run_with(&table, &encoder, &clt).unwrap();
        LatentArchive::read(&out.join("negatives_IPR000786.safetensors.gz")).unwrap()
    };

    let dir = tempfile::tempdir().unwrap();
    let a = run(&dir.path().join("a"));
    let b = run(&dir.path().join("b"));
    assert_eq!(a.entries(), b.entries());
    for (x, y) in a.activations().iter().zip(b.activations().iter()) {
        let x: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        let y: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(x, y);
    }
}

/// Archive → top activations over real extracted latents
#[test]
fn test_top_activations_from_archive() {
    let (encoder, _varmap) = tiny_encoder(2);
    let clt = random_clt(2, 8, 6, Some(6));
    let extractor = LatentExtractor::new(
        &encoder,
        &clt,
        ExtractionOptions::for_transcoder(&clt).unwrap(),
    )
    .unwrap();

    let sequences: Vec<String> = ["MKVLA", "AG", "WWGYMK"].iter().map(|s| s.to_string()).collect();
    let entries: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
    let activations = extractor.extract(&sequences).unwrap();
    let archive = LatentArchive::new(activations, entries, sequences).unwrap();

    let nodes: FeatureNodes =
        serde_json::from_str(r#"{"family": "IPR001478", "nodes": {"1": [0, 5], "0": [2]}}"#).unwrap();
    let top = top_activations(&archive, &nodes, 2).unwrap();
    assert_eq!(top.family, "IPR001478");
    assert_eq!(top.layers.len(), 2);
    for latents in top.layers.values() {
        for examples in latents.values() {
            assert_eq!(examples.len(), 2);
            assert!(examples[0].peak_value >= examples[1].peak_value);
            let seq_len = archive.sequences()[examples[0].sequence_index].len();
            assert_eq!(examples[0].trace.len(), seq_len);
        }
    }
}

/// Pretrained ESM-2 8M, only when cached locally
#[test]
fn test_pretrained_esm2_extraction() {
    let cache = hf_hub::Cache::default();
    let repo = cache.repo(Repo::new(ESM_REPO.to_string(), RepoType::Model));
    if repo.get("config.json").is_none() || repo.get("model.safetensors").is_none() {
        eprintln!("  SKIP test_pretrained_esm2_extraction: {ESM_REPO} not in local cache");
        return;
    }

    let encoder = EsmEncoder::load(ESM_REPO, &Device::Cpu, DType::F32).unwrap();
    assert_eq!(encoder.n_layers(), 6);
    assert_eq!(encoder.d_model(), 320);

    let clt = random_clt(6, 320, 64, Some(8));
    let extractor = LatentExtractor::new(
        &encoder,
        &clt,
        ExtractionOptions::for_transcoder(&clt).unwrap(),
    )
    .unwrap();

    let sequences: Vec<String> = ["MKTAYIAKQRQISFVKSHFSRQ", "MSTNPKPQRKTKRNTNRRPQDVKFPGG", "ACDEFGHIK"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let out = extractor.extract(&sequences).unwrap();
    assert_eq!(out.len(), 3);
    for (array, seq) in out.iter().zip(&sequences) {
        assert_eq!(array.dims(), &[6, seq.len(), 64]);
    }
}
