/// DADA2 denoising and conversion of its dereplicated output into ASVs

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_json::json;

use crate::config::defs::{PipelineError, COMBINED_TAG, DADA2_TAG};
use crate::config::run::{Clustering, RunConfiguration};
use crate::pipelines::sample::SampleJob;
use crate::utils::biom::Biom;
use crate::utils::command::CommandInvocation;
use crate::utils::fastx::{sequence_reader, write_fasta_record};
use crate::utils::file::{append_to_log, remove_if_exists};
use crate::utils::table::{cell, table_error, tsv_reader_with_header};
use crate::utils::tempfiles::TempFileRegistry;
use crate::utils::tools::{dada2, Tool};

/// Denoised read pair of one sample, as listed by `dada2_process.R`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenoisedPair {
    pub r1: PathBuf,
    pub r2: PathBuf,
}

/// Parses the `R1,R2` file list written by the denoiser.
///
/// # Arguments
///
/// * `content` - File content, one sample per line in input order.
/// * `expected` - Number of samples sent to the denoiser.
pub fn parse_denoised_list(content: &str, expected: usize) -> Result<Vec<DenoisedPair>, PipelineError> {
    let mut pairs = Vec::with_capacity(expected);
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (r1, r2) = line
            .split_once(',')
            .ok_or_else(|| PipelineError::parse(DADA2_TAG, format!("no R2 file in line '{}'", line)))?;
        pairs.push(DenoisedPair { r1: PathBuf::from(r1.trim()), r2: PathBuf::from(r2.trim()) });
    }
    if pairs.len() != expected {
        return Err(PipelineError::parse(
            DADA2_TAG,
            format!("{} samples were denoised but {} were expected", pairs.len(), expected),
        ));
    }
    Ok(pairs)
}

/// Runs the denoiser over the cleaned pairs of every sample.
///
/// # Arguments
///
/// * `config` - Run options, must be in DADA2 mode.
/// * `cleaned` - Finished `CleanBeforeDenoising` jobs, in sample order.
/// * `registry` - Run registry. The denoiser writes into its directory.
///
/// # Returns
/// Denoised pairs in sample order.
pub async fn denoise(
    config: &RunConfiguration,
    cleaned: &[SampleJob],
    registry: &mut TempFileRegistry,
) -> Result<Vec<DenoisedPair>, PipelineError> {
    let pseudo_pooling = match config.clustering {
        Clustering::Dada2 { pseudo_pooling } => pseudo_pooling,
        Clustering::Swarm { .. } => return Err(PipelineError::config("denoising requested in swarm mode")),
    };
    let mut r2_files = Vec::with_capacity(cleaned.len());
    for job in cleaned {
        let r2 = job
            .filtered_r2
            .clone()
            .ok_or_else(|| PipelineError::config(format!("sample {} has no cleaned R2 file", job.sample.name)))?;
        r2_files.push(r2);
    }

    let stderr = registry.add("dada2.stderr")?;
    let file_names = registry.add("tmp_output_filenames")?;
    append_to_log(&config.outputs.log, "##Sample\nAll\n##Commands\n")?;
    let tool = Tool::Dada2Core(dada2::Params {
        r1_files: cleaned.iter().map(|j| j.filtered.clone()).collect(),
        r2_files,
        output_dir: registry.dir().to_path_buf(),
        threads: config.nb_cpus,
        file_names: file_names.path.clone(),
        stderr: stderr.path,
        pseudo_pooling,
        debug: config.debug,
    });
    CommandInvocation::new(tool, config).submit(&config.outputs.log).await?;

    let pairs = parse_denoised_list(&fs::read_to_string(&file_names.path)?, cleaned.len())?;
    info!("{} samples denoised", pairs.len());
    Ok(pairs)
}

/// Removes the files written by the denoiser. Kept in debug mode.
pub fn remove_denoised(config: &RunConfiguration, pairs: &[DenoisedPair]) -> Result<(), PipelineError> {
    if config.debug {
        return Ok(());
    }
    for pair in pairs {
        remove_if_exists(&pair.r1)?;
        remove_if_exists(&pair.r2)?;
    }
    Ok(())
}

fn cluster_name(idx: usize, id: &str) -> String {
    if id.contains(COMBINED_TAG) {
        format!("Cluster_{}_{}", idx, COMBINED_TAG)
    } else {
        format!("Cluster_{}", idx)
    }
}

/// Turns the global dereplication into the run's ASV outputs: every unique
/// sequence becomes one `Cluster_<n>` observation.
///
/// # Arguments
///
/// * `count` - Global count table (`#id<TAB>sample...`), rows in FASTA order.
/// * `fasta` - Global dereplicated FASTA.
/// * `out_biom` - BIOM written.
/// * `out_fasta` - Renamed sequences written.
pub fn to_biom_and_fasta(count: &Path, fasta: &Path, out_biom: &Path, out_fasta: &Path) -> Result<(), PipelineError> {
    let mut writer = BufWriter::new(File::create(out_fasta)?);
    for (idx, record) in sequence_reader(fasta)?.records()?.into_iter().enumerate() {
        write_fasta_record(&mut writer, &cluster_name(idx + 1, record.id()), None, record.seq())?;
    }
    writer.flush()?;

    let mut biom = Biom::new("dada2");
    let mut reader = tsv_reader_with_header(count)?;
    let header = reader.headers().map_err(|e| table_error(count, e))?.clone();
    if header.len() < 2 {
        return Err(PipelineError::DataIntegrity(format!("{} has no sample column", count.display())));
    }
    let samples: Vec<usize> = header.iter().skip(1).map(|name| biom.add_sample(name)).collect();

    let mut cluster_idx = 1;
    for record in reader.records() {
        let record = record.map_err(|e| table_error(count, e))?;
        let seq_id = record.get(0).unwrap_or_default();
        let comment: Vec<&str> = if seq_id.contains(COMBINED_TAG) { vec![COMBINED_TAG] } else { Vec::new() };
        let observation = biom.add_observation(&cluster_name(cluster_idx, seq_id), json!({"comment": comment, "seed_id": ""}));
        for (idx, sample) in samples.iter().enumerate() {
            let value: u64 = cell(count, &record, idx + 1)?;
            biom.set_count(observation, *sample, value);
        }
        cluster_idx += 1;
    }
    debug!("{} ASVs written to {}", cluster_idx - 1, out_biom.display());
    biom.write(out_biom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_denoised_list() -> Result<(), PipelineError> {
        let pairs = parse_denoised_list("/t/A_R1.fq.gz,/t/A_R2.fq.gz\n/t/B_R1.fq.gz,/t/B_R2.fq.gz\n", 2)?;
        assert_eq!(pairs[1], DenoisedPair { r1: PathBuf::from("/t/B_R1.fq.gz"), r2: PathBuf::from("/t/B_R2.fq.gz") });
        assert!(parse_denoised_list("/t/A_R1.fq.gz,/t/A_R2.fq.gz\n", 2).is_err());
        assert!(parse_denoised_list("/t/A_R1.fq.gz\n", 1).is_err());
        Ok(())
    }

    #[test]
    fn test_to_biom_and_fasta() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let fasta = dir.path().join("derep.fasta");
        fs::write(&fasta, ">seqA;size=5\nACGT\n>seqB_FROGS_combined;size=2\nACNNGT\n")?;
        let count = dir.path().join("count.tsv");
        fs::write(&count, "#id\tS1\tS2\nseqA;size=5\t3\t2\nseqB_FROGS_combined;size=2\t0\t2\n")?;
        let out_biom = dir.path().join("out.biom");
        let out_fasta = dir.path().join("out.fasta");
        to_biom_and_fasta(&count, &fasta, &out_biom, &out_fasta)?;

        assert_eq!(fs::read_to_string(&out_fasta)?, ">Cluster_1\nACGT\n>Cluster_2_FROGS_combined\nACNNGT\n");
        let biom = Biom::from_json(&out_biom)?;
        assert_eq!(biom.generated_by, "dada2");
        assert_eq!(biom.sample_names(), vec!["S1", "S2"]);
        assert_eq!(biom.rows[1].id, "Cluster_2_FROGS_combined");
        assert_eq!(biom.rows[1].metadata, Some(json!({"comment": ["FROGS_combined"], "seed_id": ""})));
        assert_eq!(biom.observation_totals(), vec![5, 2]);
        assert_eq!(biom.data.len(), 3);

        fs::write(&count, "#id\tS1\tS2\nseqA;size=5\t3\n")?;
        let err = to_biom_and_fasta(&count, &fasta, &out_biom, &out_fasta).err();
        assert!(matches!(err, Some(PipelineError::DataIntegrity(_))));
        Ok(())
    }

    #[test]
    fn test_remove_denoised_keeps_in_debug() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let pair = DenoisedPair { r1: dir.path().join("a_R1.fq"), r2: dir.path().join("a_R2.fq") };
        fs::write(&pair.r1, "")?;
        fs::write(&pair.r2, "")?;
        let debug = RunConfiguration { debug: true, ..Default::default() };
        remove_denoised(&debug, std::slice::from_ref(&pair))?;
        assert!(pair.r1.exists());
        remove_denoised(&RunConfiguration::default(), std::slice::from_ref(&pair))?;
        assert!(!pair.r1.exists() && !pair.r2.exists());
        Ok(())
    }
}
