/// Sparse BIOM 1.0 (JSON) abundance tables

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::defs::PipelineError;

const BIOM_FORMAT: &str = "Biological Observation Matrix 1.0.0";
const BIOM_FORMAT_URL: &str = "http://biom-format.org";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiomEntry {
    pub id: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// (observation index, sample index, count). Counts may be written as floats
/// by other BIOM producers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCell")]
pub struct BiomCell(pub usize, pub usize, pub u64);

#[derive(Deserialize)]
struct RawCell(usize, usize, f64);

impl From<RawCell> for BiomCell {
    fn from(raw: RawCell) -> Self {
        BiomCell(raw.0, raw.1, raw.2.max(0.0).round() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Biom {
    pub id: Option<String>,
    pub format: String,
    pub format_url: String,
    #[serde(rename = "type")]
    pub table_type: String,
    pub generated_by: String,
    pub date: String,
    pub matrix_type: String,
    pub matrix_element_type: String,
    pub shape: [usize; 2],
    pub data: Vec<BiomCell>,
    pub rows: Vec<BiomEntry>,
    pub columns: Vec<BiomEntry>,
}

/// Per-sample split between observations seen only in that sample and
/// observations shared with others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleDistribution {
    pub shared_seq: u64,
    pub shared_observations: u64,
    pub own_seq: u64,
    pub own_observations: u64,
}

impl Biom {
    pub fn new(generated_by: &str) -> Self {
        Biom {
            id: None,
            format: BIOM_FORMAT.to_string(),
            format_url: BIOM_FORMAT_URL.to_string(),
            table_type: "OTU table".to_string(),
            generated_by: generated_by.to_string(),
            date: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            matrix_type: "sparse".to_string(),
            matrix_element_type: "int".to_string(),
            shape: [0, 0],
            data: Vec::new(),
            rows: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn from_json(path: &Path) -> Result<Biom, PipelineError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn add_sample(&mut self, name: &str) -> usize {
        self.columns.push(BiomEntry { id: name.to_string(), metadata: None });
        self.shape[1] = self.columns.len();
        self.columns.len() - 1
    }

    pub fn add_observation(&mut self, id: &str, metadata: Value) -> usize {
        self.rows.push(BiomEntry { id: id.to_string(), metadata: Some(metadata) });
        self.shape[0] = self.rows.len();
        self.rows.len() - 1
    }

    /// Sets a count, replacing any previous value. Zero removes the cell.
    pub fn set_count(&mut self, observation: usize, sample: usize, count: u64) {
        self.data.retain(|c| !(c.0 == observation && c.1 == sample));
        if count > 0 {
            self.data.push(BiomCell(observation, sample, count));
        }
    }

    pub fn sample_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.id.as_str()).collect()
    }

    /// Total count of every observation, by row index.
    pub fn observation_totals(&self) -> Vec<u64> {
        let mut totals = vec![0u64; self.rows.len()];
        for cell in &self.data {
            if let Some(total) = totals.get_mut(cell.0) {
                *total += cell.2;
            }
        }
        totals
    }

    /// Own/shared observation split for every sample, keyed by sample name.
    /// An observation is owned by a sample when all of its reads are there.
    pub fn sample_distributions(&self) -> HashMap<String, SampleDistribution> {
        let totals = self.observation_totals();
        let mut by_sample: Vec<SampleDistribution> = vec![SampleDistribution::default(); self.columns.len()];
        for cell in &self.data {
            let (observation, sample, count) = (cell.0, cell.1, cell.2);
            let Some(distribution) = by_sample.get_mut(sample) else {
                continue;
            };
            if count != 0 && totals.get(observation) == Some(&count) {
                distribution.own_observations += 1;
                distribution.own_seq += count;
            } else {
                distribution.shared_observations += 1;
                distribution.shared_seq += count;
            }
        }
        self.columns
            .iter()
            .zip(by_sample)
            .map(|(column, distribution)| (column.id.clone(), distribution))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> Biom {
        let mut biom = Biom::new("test");
        let a = biom.add_sample("A");
        let b = biom.add_sample("B");
        let o1 = biom.add_observation("Cluster_1", json!({"comment": [], "seed_id": ""}));
        let o2 = biom.add_observation("Cluster_2", json!({"comment": ["FROGS_combined"], "seed_id": ""}));
        biom.set_count(o1, a, 10);
        biom.set_count(o1, b, 5);
        biom.set_count(o2, a, 7);
        biom
    }

    #[test]
    fn test_distribution() {
        let biom = table();
        assert_eq!(biom.shape, [2, 2]);
        assert_eq!(biom.observation_totals(), vec![15, 7]);
        let distrib = biom.sample_distributions();
        assert_eq!(
            distrib["A"],
            SampleDistribution { shared_seq: 10, shared_observations: 1, own_seq: 7, own_observations: 1 }
        );
        assert_eq!(
            distrib["B"],
            SampleDistribution { shared_seq: 5, shared_observations: 1, own_seq: 0, own_observations: 0 }
        );
    }

    #[test]
    fn test_set_count_replaces() {
        let mut biom = table();
        biom.set_count(0, 0, 3);
        biom.set_count(1, 0, 0);
        assert_eq!(biom.observation_totals(), vec![8, 0]);
        assert_eq!(biom.data.len(), 2);
    }

    #[test]
    fn test_json_round_trip_accepts_float_counts() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.biom");
        table().write(&path)?;
        let read = Biom::from_json(&path)?;
        assert_eq!(read.sample_names(), vec!["A", "B"]);
        assert_eq!(read.observation_totals(), vec![15, 7]);

        let float = dir.path().join("f.biom");
        let mut value = serde_json::to_value(table())?;
        value["data"] = json!([[0, 0, 2.0], [1, 1, 4.0]]);
        std::fs::write(&float, value.to_string())?;
        assert_eq!(Biom::from_json(&float)?.observation_totals(), vec![2, 4]);
        Ok(())
    }
}
