/// Reading the sample logs back and writing the HTML summary

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::defs::PipelineError;
use crate::utils::biom::Biom;
use crate::utils::file::first_line;
use crate::utils::table::{cell, table_error, tsv_reader};

const SUMMARY_TEMPLATE: &str = include_str!("../../templates/preprocess_tpl.html");

const BEFORE_PROCESS: &str = "before process";
const MERGED: &str = "merged";
const ARTIFICIAL: &str = "artificial combined";
const PAIRED_ASSEMBLED: &str = "paired-end assembled";
const ARTIFICIAL_MARKERS: &[&str] = &[
    "combine_and_split",
    "Removes read pairs without the 5' and 3' primer and removes primer sequence.",
];

/// Read lengths of one sample before and after filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LengthHistogram {
    pub before: BTreeMap<usize, u64>,
    pub after: BTreeMap<usize, u64>,
}

impl LengthHistogram {
    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        serde_json::to_writer(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<LengthHistogram, PipelineError> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }
}

/// Counters of one sample log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleResults {
    pub before_process: u64,
    pub merged: BTreeMap<String, u64>,
    pub artificial_combined: Option<BTreeMap<String, u64>>,
}

fn step_name(line: &str) -> Option<String> {
    let rest = line.split("nb seq").nth(1)?;
    Some(rest.split(':').next()?.trim().to_string())
}

fn step_value(line: &str) -> Result<u64, PipelineError> {
    line.split(':')
        .nth(1)
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| PipelineError::parse("summary", format!("unreadable counter line '{}'", line.trim())))
}

/// Ordered filter steps found in a sample log, starting with `before process`.
pub fn filter_steps(log: &Path) -> Result<Vec<String>, PipelineError> {
    let mut steps = vec![BEFORE_PROCESS.to_string()];
    for line in BufReader::new(File::open(log)?).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.starts_with("nb seq") && !trimmed.starts_with("nb seq before process") {
            if let Some(step) = step_name(trimmed) {
                if !steps.contains(&step) {
                    steps.push(step);
                }
            }
        }
    }
    Ok(steps)
}

/// Number of reads left after each step of one sample. Counters written
/// after the artificial combination branch starts go to their own group.
pub fn sample_results(log: &Path) -> Result<SampleResults, PipelineError> {
    let mut results = SampleResults::default();
    let mut artificial = false;
    for line in BufReader::new(File::open(log)?).lines() {
        let line = line?;
        if ARTIFICIAL_MARKERS.iter().any(|m| line.contains(m)) {
            artificial = true;
            results.artificial_combined.get_or_insert_with(BTreeMap::new);
        }
        let trimmed = line.trim();
        if trimmed.starts_with("nb seq before process") {
            results.before_process = step_value(trimmed)?;
        } else if trimmed.starts_with("nb seq") {
            let Some(step) = step_name(trimmed) else { continue };
            let value = step_value(trimmed)?;
            let group = match (&mut results.artificial_combined, artificial) {
                (Some(group), true) => group,
                _ => &mut results.merged,
            };
            group.insert(step, value);
        }
    }
    Ok(results)
}

/// (cluster sizes, number of clusters of that size), zero counts skipped.
pub fn read_depths(path: &Path) -> Result<(Vec<u64>, Vec<u64>), PipelineError> {
    let mut sizes = Vec::new();
    let mut counts = Vec::new();
    for record in tsv_reader(path)?.records() {
        let record = record.map_err(|e| table_error(path, e))?;
        if record.len() < 2 || record.get(1).map(str::trim) == Some("0") {
            continue;
        }
        sizes.push(cell(path, &record, 0)?);
        counts.push(cell(path, &record, 1)?);
    }
    Ok((sizes, counts))
}

/// Files the summary is computed from.
#[derive(Debug, Clone)]
pub struct SummaryInputs {
    pub sample_names: Vec<String>,
    pub length_files: Vec<PathBuf>,
    pub log_files: Vec<PathBuf>,
    pub biom: PathBuf,
    pub depths: PathBuf,
    pub classification: PathBuf,
}

/// Fills the summary template and writes it to `output`.
///
/// # Arguments
///
/// * `inputs` - Per-sample logs and histograms (same order as the names)
///   plus the global BIOM, depth and newick files.
/// * `output` - HTML file to write.
pub fn write_summary(inputs: &SummaryInputs, output: &Path) -> Result<(), PipelineError> {
    let categories = match inputs.log_files.first() {
        Some(log) => filter_steps(log)?,
        None => vec![BEFORE_PROCESS.to_string()],
    };

    let mut before_process = serde_json::Map::new();
    let mut merged = serde_json::Map::new();
    let mut artificial = serde_json::Map::new();
    let mut before_lengths = serde_json::Map::new();
    let mut after_lengths = serde_json::Map::new();

    for ((name, log), lengths) in inputs.sample_names.iter().zip(&inputs.log_files).zip(&inputs.length_files) {
        let results = sample_results(log)?;
        before_process.insert(name.clone(), Value::from(results.before_process));
        if let Some(mut combined) = results.artificial_combined {
            let assembled = results.merged.get(PAIRED_ASSEMBLED).copied().unwrap_or(0);
            combined.insert(PAIRED_ASSEMBLED.to_string(), results.before_process.saturating_sub(assembled));
            artificial.insert(name.clone(), serde_json::to_value(combined)?);
        }
        merged.insert(name.clone(), serde_json::to_value(&results.merged)?);

        let histogram = LengthHistogram::read(lengths)?;
        before_lengths.insert(name.clone(), serde_json::to_value(&histogram.before)?);
        after_lengths.insert(name.clone(), serde_json::to_value(&histogram.after)?);
    }

    let mut filters = serde_json::Map::new();
    filters.insert(BEFORE_PROCESS.to_string(), Value::Object(before_process));
    filters.insert(MERGED.to_string(), Value::Object(merged));
    if !artificial.is_empty() {
        filters.insert(ARTIFICIAL.to_string(), Value::Object(artificial));
    }

    let (cluster_sizes, counts) = read_depths(&inputs.depths)?;
    let distributions = Biom::from_json(&inputs.biom)?.sample_distributions();
    let distributions: BTreeMap<_, _> = distributions.into_iter().collect();
    let newick = first_line(&inputs.classification)?;

    let tokens: [(&str, String); 8] = [
        ("###CLUSTERS_SIZES###", serde_json::to_string(&cluster_sizes)?),
        ("###DATA_COUNTS###", serde_json::to_string(&counts)?),
        ("###DATA_SAMPLE###", serde_json::to_string(&distributions)?),
        ("###NEWICK###", serde_json::to_string(&newick)?),
        ("###FILTERS_CATEGORIES###", serde_json::to_string(&categories)?),
        ("###FILTERS_DATA###", serde_json::to_string(&filters)?),
        ("###BEFORE_LENGTHS_DATA###", serde_json::to_string(&before_lengths)?),
        ("###AFTER_LENGTHS_DATA###", serde_json::to_string(&after_lengths)?),
    ];
    let mut html = SUMMARY_TEMPLATE.to_string();
    for (token, value) in &tokens {
        html = html.replace(token, value);
    }
    fs::write(output, html)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::biom::Biom;
    use serde_json::json;

    const SAMPLE_LOG: &str = "##Sample\nR1 : a_R1.fq\nR2 : a_R2.fq\nSample name : A\nnb seq before process : 100\n##Commands\n\
########################################################################\n# join overlapping paired reads (vsearch version : v2.21)\n\
Results:\n\tnb seq paired-end assembled: 80\n\
# Removes reads without the 5' primer and removes primer sequence. (cutadapt version : 4.4)\nResults:\n\tnb seq with 5' primer : 78\n\
Results:\n\tnb seq with expected length : 70\n\tnb seq without N : 69\n\
# Concatenate paired reads. (combine_and_split.py version : 1.0)\n\
Results:\n\tnb seq with expected length : 15\n\tnb seq without N : 14\n";

    #[test]
    fn test_filter_steps_and_results() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("A_log.txt");
        fs::write(&log, SAMPLE_LOG)?;

        let steps = filter_steps(&log)?;
        assert_eq!(
            steps,
            vec!["before process", "paired-end assembled", "with 5' primer", "with expected length", "without N"]
        );

        let results = sample_results(&log)?;
        assert_eq!(results.before_process, 100);
        assert_eq!(results.merged["paired-end assembled"], 80);
        assert_eq!(results.merged["without N"], 69);
        let art = results.artificial_combined.unwrap_or_default();
        assert_eq!(art["with expected length"], 15);
        assert_eq!(art["without N"], 14);
        Ok(())
    }

    #[test]
    fn test_unreadable_counter() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("bad.txt");
        fs::write(&log, "nb seq before process : many\n")?;
        assert!(sample_results(&log).is_err());
        Ok(())
    }

    #[test]
    fn test_read_depths() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let depths = dir.path().join("depths.tsv");
        fs::write(&depths, "#Depth\tNb_Observ\n1\t10\n2\t0\n3\t4\n")?;
        assert_eq!(read_depths(&depths)?, (vec![1, 3], vec![10, 4]));
        fs::write(&depths, "#Depth\tNb_Observ\n1\tten\n")?;
        assert!(matches!(read_depths(&depths), Err(PipelineError::DataIntegrity(_))));
        Ok(())
    }

    #[test]
    fn test_write_summary() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("A_log.txt");
        fs::write(&log, SAMPLE_LOG)?;
        let lengths = dir.path().join("A_lengths.json");
        let mut histogram = LengthHistogram::default();
        histogram.before.insert(250, 80);
        histogram.after.insert(210, 69);
        histogram.write(&lengths)?;

        let mut biom = Biom::new("test");
        let a = biom.add_sample("A");
        let o = biom.add_observation("Cluster_1", json!({"comment": [], "seed_id": ""}));
        biom.set_count(o, a, 83);
        let biom_path = dir.path().join("abundance.biom");
        biom.write(&biom_path)?;
        let depths = dir.path().join("depths.tsv");
        fs::write(&depths, "#Depth\tNb_Observ\n83\t1\n")?;
        let classif = dir.path().join("classif.txt");
        fs::write(&classif, "(A:0.0);\n")?;

        let output = dir.path().join("summary.html");
        let inputs = SummaryInputs {
            sample_names: vec!["A".to_string()],
            length_files: vec![lengths],
            log_files: vec![log],
            biom: biom_path,
            depths,
            classification: classif,
        };
        write_summary(&inputs, &output)?;

        let html = fs::read_to_string(&output)?;
        assert!(!html.contains("###"));
        assert!(html.contains(r#""(A:0.0);""#));
        assert!(html.contains(r#"{"A":{"250":80}}"#));
        assert!(html.contains(r#""paired-end assembled":20"#));
        assert!(html.contains(r#""own_seq":83"#));
        Ok(())
    }
}
