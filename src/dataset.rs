//! Protein table loading, family filtering and seeded sampling
//!
//! Tables are read from parquet (the Swiss-Prot export) or from JSON,
//! chosen by file extension. Only the `Entry`, `Sequence` and `InterPro`
//! columns are kept; every other column is ignored.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use arrow::array::AsArray;
use arrow::compute::cast;
use arrow::datatypes::DataType;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

/// Column holding the sequence identifier (UniProt accession)
pub const ENTRY_COLUMN: &str = "Entry";
/// Column holding the amino-acid sequence
pub const SEQUENCE_COLUMN: &str = "Sequence";
/// Column holding the `;`-separated InterPro family annotations
pub const FAMILY_COLUMN: &str = "InterPro";

const COLUMNS: [&str; 3] = [ENTRY_COLUMN, SEQUENCE_COLUMN, FAMILY_COLUMN];

/// Raw JSON structure for loading: either columns or row records.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TableFile {
    Columns(HashMap<String, Vec<Option<String>>>),
    Records(Vec<HashMap<String, Option<String>>>),
}

/// A sampled group of sequences, parallel `entries` / `sequences`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceSample {
    pub entries: Vec<String>,
    pub sequences: Vec<String>,
}

impl SequenceSample {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rows of a target-family split, as indices into the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilySplit {
    pub members: Vec<usize>,
    pub non_members: Vec<usize>,
}

/// Protein table with the three columns the pipeline needs.
#[derive(Debug, Clone)]
pub struct ProteinTable {
    entries: Vec<String>,
    sequences: Vec<String>,
    families: Vec<Option<String>>,
}

impl ProteinTable {
    /// Load a table from a `.parquet` file, or from JSON otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let is_parquet = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("parquet"));
        if is_parquet {
            Self::from_columns(read_parquet_columns(path)?)
        } else {
            Self::load_json(path)
        }
    }

    /// Load a table from a JSON file (column-oriented or row records).
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset {}", path.display()))?;
        let file: TableFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse dataset {}", path.display()))?;

        let columns = match file {
            TableFile::Columns(columns) => columns,
            TableFile::Records(records) => records_to_columns(records),
        };
        Self::from_columns(columns)
    }

    /// Build a table from named columns, validating required columns.
    pub fn from_columns(mut columns: HashMap<String, Vec<Option<String>>>) -> Result<Self> {
        let mut take = |name: &str| {
            columns
                .remove(name)
                .ok_or_else(|| anyhow::anyhow!("Dataset is missing the '{name}' column"))
        };
        let families = take(FAMILY_COLUMN)?;
        let entries = take(ENTRY_COLUMN)?;
        let sequences = take(SEQUENCE_COLUMN)?;

        anyhow::ensure!(
            entries.len() == sequences.len() && sequences.len() == families.len(),
            "Dataset columns have different lengths: {} entries, {} sequences, {} families",
            entries.len(),
            sequences.len(),
            families.len()
        );

        let entries = require_values(entries, ENTRY_COLUMN)?;
        let sequences = require_values(sequences, SEQUENCE_COLUMN)?;

        Ok(Self {
            entries,
            sequences,
            families,
        })
    }

    /// Total number of rows
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether row `row` is annotated with `target`. Null annotations never match.
    pub fn has_family(&self, row: usize, target: &str) -> bool {
        self.families
            .get(row)
            .and_then(|f| f.as_deref())
            .is_some_and(|f| f.contains(target))
    }

    /// Split all rows into members and non-members of `target`, in table order.
    pub fn split_by_family(&self, target: &str) -> FamilySplit {
        let (members, non_members) = (0..self.len()).partition(|&row| self.has_family(row, target));
        FamilySplit {
            members,
            non_members,
        }
    }

    /// Draw `min(n, rows.len())` of `rows` in a seeded random order.
    pub fn sample(&self, rows: &[usize], n: usize, seed: u64) -> SequenceSample {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut rows = rows.to_vec();
        rows.shuffle(&mut rng);
        rows.truncate(n);

        SequenceSample {
            entries: rows.iter().map(|&r| self.entries[r].clone()).collect(),
            sequences: rows.iter().map(|&r| self.sequences[r].clone()).collect(),
        }
    }
}

/// Read the needed string columns of a parquet file. Nulls become `None`.
///
/// Columns are cast to `Utf8`, so `LargeUtf8` and view-typed strings
/// written by dataframe libraries load the same way.
fn read_parquet_columns(path: &Path) -> Result<HashMap<String, Vec<Option<String>>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open dataset {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Failed to read parquet dataset {}", path.display()))?;

    let roots: Vec<usize> = builder
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, field)| COLUMNS.contains(&field.name().as_str()))
        .map(|(i, _)| i)
        .collect();
    let mut columns: HashMap<String, Vec<Option<String>>> = roots
        .iter()
        .map(|&i| (builder.schema().field(i).name().clone(), Vec::new()))
        .collect();

    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    let reader = builder.with_projection(mask).build()?;
    for batch in reader {
        let batch = batch.with_context(|| format!("Failed to decode {}", path.display()))?;
        let schema = batch.schema();
        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            let name = field.name();
            let strings = cast(array.as_ref(), &DataType::Utf8)
                .with_context(|| format!("Column '{name}' is not a string column"))?;
            let strings = strings
                .as_string_opt::<i32>()
                .ok_or_else(|| anyhow::anyhow!("Column '{name}' did not cast to Utf8"))?;
            columns
                .entry(name.clone())
                .or_default()
                .extend(strings.iter().map(|v| v.map(str::to_string)));
        }
    }
    Ok(columns)
}

fn records_to_columns(
    records: Vec<HashMap<String, Option<String>>>,
) -> HashMap<String, Vec<Option<String>>> {
    let names: std::collections::BTreeSet<String> =
        records.iter().flat_map(|r| r.keys().cloned()).collect();
    names
        .into_iter()
        .map(|name| {
            let column = records
                .iter()
                .map(|r| r.get(&name).cloned().flatten())
                .collect();
            (name, column)
        })
        .collect()
}

fn require_values(column: Vec<Option<String>>, name: &str) -> Result<Vec<String>> {
    column
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.ok_or_else(|| anyhow::anyhow!("Row {row} has no value in '{name}'")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    fn table() -> ProteinTable {
        let columns = HashMap::from([
            (
                ENTRY_COLUMN.to_string(),
                column(&[Some("P1"), Some("P2"), Some("P3"), Some("P4")]),
            ),
            (
                SEQUENCE_COLUMN.to_string(),
                column(&[Some("MKV"), Some("MKVLA"), Some("AG"), Some("MMMM")]),
            ),
            (
                FAMILY_COLUMN.to_string(),
                column(&[Some("IPR000786;IPR036412;"), None, Some("IPR011584;"), Some("IPR000786;")]),
            ),
        ]);
        ProteinTable::from_columns(columns).unwrap()
    }

    #[test]
    fn test_split_by_family() {
        let t = table();
        let split = t.split_by_family("IPR000786");
        assert_eq!(split.members, vec![0, 3]);
        assert_eq!(split.non_members, vec![1, 2]);

        let none = t.split_by_family("IPR999999");
        assert!(none.members.is_empty());
        assert_eq!(none.non_members.len(), 4);
    }

    #[test]
    fn test_null_family_never_matches() {
        let t = table();
        assert!(!t.has_family(1, ""));
        assert!(t.has_family(0, "IPR036412"));
        assert!(!t.has_family(99, "IPR000786"));
    }

    #[test]
    fn test_missing_family_column_is_fatal() {
        let columns = HashMap::from([
            (ENTRY_COLUMN.to_string(), column(&[Some("P1")])),
            (SEQUENCE_COLUMN.to_string(), column(&[Some("MKV")])),
        ]);
        let err = ProteinTable::from_columns(columns).unwrap_err();
        assert!(err.to_string().contains("InterPro"));
    }

    #[test]
    fn test_null_sequence_is_fatal() {
        let columns = HashMap::from([
            (ENTRY_COLUMN.to_string(), column(&[Some("P1")])),
            (SEQUENCE_COLUMN.to_string(), column(&[None])),
            (FAMILY_COLUMN.to_string(), column(&[None])),
        ]);
        assert!(ProteinTable::from_columns(columns).is_err());
    }

    #[test]
    fn test_sample_clamps_and_is_deterministic() {
        let t = table();
        let rows: Vec<usize> = (0..t.len()).collect();

        let a = t.sample(&rows, 3, 42);
        let b = t.sample(&rows, 3, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);

        let all = t.sample(&rows, 50, 42);
        assert_eq!(all.len(), 4);
        // Entries stay paired with their sequences
        for (e, s) in all.entries.iter().zip(&all.sequences) {
            let row = t.entries.iter().position(|x| x == e).unwrap();
            assert_eq!(&t.sequences[row], s);
        }
    }

    #[test]
    fn test_records_layout() {
        let records = vec![
            HashMap::from([
                ("Entry".to_string(), Some("P1".to_string())),
                ("Sequence".to_string(), Some("MKV".to_string())),
                ("InterPro".to_string(), Some("IPR000786;".to_string())),
            ]),
            HashMap::from([
                ("Entry".to_string(), Some("P2".to_string())),
                ("Sequence".to_string(), Some("AG".to_string())),
            ]),
        ];
        let t = ProteinTable::from_columns(records_to_columns(records)).unwrap();
        assert_eq!(t.len(), 2);
        assert!(t.has_family(0, "IPR000786"));
        assert!(!t.has_family(1, "IPR000786"));
    }
}
