/// Top-level run: samples -> per-sample pipelines -> barrier -> global
/// dereplication -> clustering or ASVs -> report.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::defs::PipelineError;
use crate::config::run::{RunConfiguration, SampleSource};
use crate::pipelines::aggregate::aggregate;
use crate::pipelines::cluster::cluster;
use crate::pipelines::denoise::{denoise, remove_denoised, to_biom_and_fasta};
use crate::pipelines::dispatcher::WorkerPool;
use crate::pipelines::inputs::resolve_samples;
use crate::pipelines::sample::{Sample, SampleJob, SampleTask};
use crate::utils::command::CommandInvocation;
use crate::utils::file::append_to_log;
use crate::utils::summary::{write_summary, SummaryInputs};
use crate::utils::system::check_cpu_budget;
use crate::utils::tempfiles::TempFileRegistry;
use crate::utils::tools::Tool;

pub struct Preprocess {
    config: Arc<RunConfiguration>,
    worker_program: Option<PathBuf>,
}

impl Preprocess {
    pub fn new(config: Arc<RunConfiguration>) -> Self {
        Preprocess { config, worker_program: None }
    }

    /// Executable started for isolated workers, the running binary by default.
    pub fn with_worker_program(mut self, program: PathBuf) -> Self {
        self.worker_program = Some(program);
        self
    }

    /// Runs the whole preprocessing.
    ///
    /// # Arguments
    ///
    /// * `source` - Unresolved sample inputs.
    /// * `command_line` - Command line recorded in the run log header.
    ///
    /// # Returns
    /// Ok once every output named in the configuration is written. The run's
    /// temporary files are removed on every exit path unless in debug mode.
    pub async fn run(&self, source: &SampleSource, command_line: &str) -> Result<(), PipelineError> {
        let mut registry = TempFileRegistry::new(&work_parent(&self.config.outputs.fasta), "preprocess_", self.config.debug)?;
        let outcome = self.run_in(source, command_line, &mut registry).await;
        let cleanup = registry.delete_all();
        outcome?;
        cleanup?;
        info!("Preprocessing done, summary written to {}", self.config.outputs.summary.display());
        Ok(())
    }

    async fn run_in(
        &self,
        source: &SampleSource,
        command_line: &str,
        registry: &mut TempFileRegistry,
    ) -> Result<(), PipelineError> {
        let config = &self.config;
        let log = &config.outputs.log;
        fs::write(
            log,
            format!(
                "## Application\nSoftware: {} (version: {})\nCommand: {}\n\n",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                command_line
            ),
        )?;
        let mut warnings = config.warnings.clone();
        warnings.extend(check_cpu_budget(config.nb_cpus).await);
        for warning in &warnings {
            append_to_log(log, &format!("Warning: {}\n\n", warning))?;
        }

        let samples = resolve_samples(source, config.is_contiged(), registry, log)?;
        if samples.is_empty() {
            return Err(PipelineError::config("No sample to process."));
        }

        let mut pool = WorkerPool::new(config.clone(), registry.dir());
        if let Some(program) = &self.worker_program {
            pool = pool.with_worker_program(program.clone());
        }

        let jobs = if config.is_dada2() {
            self.run_dada2(&samples, &pool, registry).await?
        } else {
            self.run_swarm(&samples, &pool, registry).await?
        };
        self.report(&jobs, registry).await
    }

    async fn run_swarm(
        &self,
        samples: &[Sample],
        pool: &WorkerPool,
        registry: &mut TempFileRegistry,
    ) -> Result<Vec<SampleJob>, PipelineError> {
        let mut jobs = Vec::with_capacity(samples.len());
        for sample in samples {
            let name = &sample.name;
            jobs.push(SampleJob {
                sample: sample.clone(),
                task: SampleTask::Preprocess,
                filtered: registry.add(&format!("{}_filtered.fasta", name))?.path,
                filtered_r2: None,
                artificial: registry.add(&format!("{}_artComb_filtered.fasta", name))?.path,
                count: registry.add(&format!("{}_derep_count.tsv", name))?.path,
                lengths: registry.add(&format!("{}_lengths.json", name))?.path,
                log: registry.add(&format!("{}_log.txt", name))?.path,
                work_dir: registry.dir().to_path_buf(),
            });
        }

        let results = pool.dispatch(jobs.clone(), &self.config.outputs.log).await?;
        let derep = aggregate(&self.config, &results, registry).await?;
        cluster(&self.config, &derep, registry).await?;
        Ok(jobs)
    }

    async fn run_dada2(
        &self,
        samples: &[Sample],
        pool: &WorkerPool,
        registry: &mut TempFileRegistry,
    ) -> Result<Vec<SampleJob>, PipelineError> {
        let config = &self.config;
        let mut cleaning = Vec::with_capacity(samples.len());
        for sample in samples {
            let name = &sample.name;
            cleaning.push(SampleJob {
                sample: sample.clone(),
                task: SampleTask::CleanBeforeDenoising,
                filtered: registry.add(&format!("{}_cutadapt_R1.fastq.gz", name))?.path,
                filtered_r2: Some(registry.add(&format!("{}_cutadapt_R2.fastq.gz", name))?.path),
                artificial: registry.add(&format!("{}_artComb_filter.fasta", name))?.path,
                count: registry.add(&format!("{}_after_denoising_count.tsv", name))?.path,
                lengths: registry.add(&format!("{}_lengths.json", name))?.path,
                log: registry.add(&format!("{}_log.txt", name))?.path,
                work_dir: registry.dir().to_path_buf(),
            });
        }
        pool.dispatch(cleaning.clone(), &config.outputs.log).await?;

        let pairs = denoise(config, &cleaning, registry).await?;
        let outcome = async {
            let mut jobs = Vec::with_capacity(cleaning.len());
            for (clean, pair) in cleaning.iter().zip(&pairs) {
                jobs.push(SampleJob {
                    sample: Sample {
                        name: clean.sample.name.clone(),
                        read1: pair.r1.clone(),
                        read2: Some(pair.r2.clone()),
                    },
                    task: SampleTask::AfterDenoising,
                    filtered: registry.add(&format!("{}_filter.fasta", clean.sample.name))?.path,
                    filtered_r2: None,
                    ..clean.clone()
                });
            }
            let results = pool.dispatch(jobs.clone(), &config.outputs.log).await?;
            let derep = aggregate(config, &results, registry).await?;
            to_biom_and_fasta(&derep.count, &derep.fasta, &config.outputs.biom, &config.outputs.fasta)?;
            Ok::<_, PipelineError>(jobs)
        }
        .await;
        let cleanup = remove_denoised(config, &pairs);
        let jobs = outcome?;
        cleanup?;
        Ok(jobs)
    }

    /// Tree of samples, cluster depths and the HTML summary.
    async fn report(&self, jobs: &[SampleJob], registry: &mut TempFileRegistry) -> Result<(), PipelineError> {
        let config = &self.config;
        let outputs = &config.outputs;
        let newick = registry.add("HClassif.newick")?;
        let classif_log = registry.add("HClassif_log.txt")?;
        CommandInvocation::new(
            Tool::HClassification { biom: outputs.biom.clone(), newick: newick.path.clone(), log: classif_log.path },
            config,
        )
        .submit(&outputs.log)
        .await?;

        let depths = registry.add("depths.tsv")?;
        CommandInvocation::new(Tool::Depths { biom: outputs.biom.clone(), output: depths.path.clone() }, config)
            .submit(&outputs.log)
            .await?;

        let inputs = SummaryInputs {
            sample_names: jobs.iter().map(|j| j.sample.name.clone()).collect(),
            length_files: jobs.iter().map(|j| j.lengths.clone()).collect(),
            log_files: jobs.iter().map(|j| j.log.clone()).collect(),
            biom: outputs.biom.clone(),
            depths: depths.path,
            classification: newick.path,
        };
        write_summary(&inputs, &outputs.summary)
    }
}

/// Directory holding the run's temporary files: next to the outputs.
fn work_parent(output: &Path) -> PathBuf {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_parent() {
        assert_eq!(work_parent(Path::new("sequences.fasta")), PathBuf::from("."));
        assert_eq!(work_parent(Path::new("/out/sequences.fasta")), PathBuf::from("/out"));
    }

    #[tokio::test]
    async fn test_empty_archive_list_rejected() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let mut config = RunConfiguration { nb_cpus: 1, ..Default::default() };
        config.outputs.log = dir.path().join("run.log");
        config.outputs.fasta = dir.path().join("sequences.fasta");
        let source = SampleSource::Files { r1: Vec::new(), r2: None, names: None };
        let err = Preprocess::new(Arc::new(config)).run(&source, "amplicon-preprocess longreads").await;
        assert!(err.is_err());
        let log = fs::read_to_string(dir.path().join("run.log"))?;
        assert!(log.starts_with("## Application\nSoftware: amplicon-preprocess"));
        Ok(())
    }
}
