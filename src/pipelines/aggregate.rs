/// Global dereplication of all samples and the checks run on its output

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::defs::PipelineError;
use crate::config::run::RunConfiguration;
use crate::pipelines::sample::PipelineResult;
use crate::utils::command::CommandInvocation;
use crate::utils::fastx::count_sequences;
use crate::utils::file::append_to_log;
use crate::utils::table::{cell, table_error, tsv_reader, tsv_writer};
use crate::utils::tempfiles::TempFileRegistry;
use crate::utils::tools::Tool;

const GLOBAL_HEADER: &str = "##Sample\nAll\n##Commands\n";

/// Output of the global dereplication.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDerep {
    pub fasta: PathBuf,
    pub count: PathBuf,
    pub nb_seq: u64,
}

/// Sum of every numeric cell of a count table. Comment lines and the first
/// column (sequence ids) are skipped. An unreadable cell is a data
/// integrity error.
pub fn count_table_total(path: &Path) -> Result<u64, PipelineError> {
    let mut total = 0u64;
    for record in tsv_reader(path)?.records() {
        let record = record.map_err(|e| table_error(path, e))?;
        for idx in 1..record.len() {
            let value: f64 = cell(path, &record, idx)?;
            total += value.max(0.0).round() as u64;
        }
    }
    Ok(total)
}

/// Number of sequences a sample hands to the global dereplication.
fn sample_total(result: &PipelineResult) -> Result<u64, PipelineError> {
    match &result.count_table {
        Some(count) => count_table_total(count),
        None => Ok(count_sequences(&result.filtered_fasta)?),
    }
}

/// Writes the sample reference consumed by the global dereplication.
fn write_samples_ref(results: &[PipelineResult], path: &Path) -> Result<(), PipelineError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["#Sequence_file", "Sample_name"]).map_err(|e| table_error(path, e))?;
    for result in results {
        let file = result.filtered_fasta.to_string_lossy();
        writer
            .write_record([file.as_ref(), result.sample_name.as_str()])
            .map_err(|e| table_error(path, e))?;
    }
    writer.flush()?;
    Ok(())
}

/// Dereplicates the filtered sequences of all samples into the run's
/// dereplicated FASTA and count table.
///
/// # Arguments
///
/// * `config` - Run options; `outputs.dereplicated` and `outputs.count` are written.
/// * `results` - One result per sample, in sample order.
/// * `registry` - Run registry, receives the sample reference file.
///
/// # Returns
/// The global files and their number of unique sequences. Fails with a
/// data integrity error when nothing survived the filters or when the count
/// table lost reads.
pub async fn aggregate(
    config: &RunConfiguration,
    results: &[PipelineResult],
    registry: &mut TempFileRegistry,
) -> Result<GlobalDerep, PipelineError> {
    let log = &config.outputs.log;
    append_to_log(log, GLOBAL_HEADER)?;

    let samples_ref = registry.add("derep_inputs.tsv")?;
    write_samples_ref(results, &samples_ref.path)?;
    let tool = Tool::DerepGlobal {
        samples_ref: samples_ref.path,
        output: config.outputs.dereplicated.clone(),
        count: config.outputs.count.clone(),
        nb_cpus: config.nb_cpus,
    };
    CommandInvocation::new(tool, config).submit(log).await?;

    let nb_seq = count_sequences(&config.outputs.dereplicated)?;
    if nb_seq == 0 {
        return Err(PipelineError::DataIntegrity(
            "The filters have eliminated all sequences (see summary for more details).".to_string(),
        ));
    }

    let mut expected = 0u64;
    for result in results {
        expected += sample_total(result)?;
    }
    let observed = count_table_total(&config.outputs.count)?;
    if expected != observed {
        warn!("Count table holds {} reads, samples hold {}", observed, expected);
        return Err(PipelineError::DataIntegrity(format!(
            "The global count table {} holds {} sequences but the samples hold {}.",
            config.outputs.count.display(),
            observed,
            expected
        )));
    }
    info!("{} sequences after global dereplication", observed);

    Ok(GlobalDerep { fasta: config.outputs.dereplicated.clone(), count: config.outputs.count.clone(), nb_seq })
}
