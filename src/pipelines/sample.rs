/// Per-sample processing: merge, primer removal, length/N filtering and
/// dereplication, plus the two DADA2 half-pipelines.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cli::MergeSoftware;
use crate::config::defs::*;
use crate::config::run::{RunConfiguration, Sequencer};
use crate::utils::command::CommandInvocation;
use crate::utils::fastx::{count_sequences, length_histogram};
use crate::utils::file::{append_to_log, is_gzipped};
use crate::utils::summary::LengthHistogram;
use crate::utils::tempfiles::{TempFile, TempFileRegistry};
use crate::utils::tools::{cutadapt, filter, merge_tool, Tool};

/// One biological sample. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub read1: PathBuf,
    pub read2: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleTask {
    /// Full swarm-mode preprocessing.
    Preprocess,
    /// Primer removal and N filtering of read pairs ahead of DADA2.
    CleanBeforeDenoising,
    /// Merge and filter the pairs returned by DADA2.
    AfterDenoising,
}

/// A sample plus the run-level paths its task writes. Everything else the
/// task needs lives in a private registry under `work_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleJob {
    pub sample: Sample,
    pub task: SampleTask,
    /// Dereplicated (or filtered) sequences. Cleaned R1 for `CleanBeforeDenoising`.
    pub filtered: PathBuf,
    /// Cleaned R2 for `CleanBeforeDenoising`.
    pub filtered_r2: Option<PathBuf>,
    pub artificial: PathBuf,
    pub count: PathBuf,
    pub lengths: PathBuf,
    pub log: PathBuf,
    pub work_dir: PathBuf,
}

/// What the aggregation step reads back from one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub sample_name: String,
    pub filtered_fasta: PathBuf,
    pub artificial_combined_fasta: Option<PathBuf>,
    pub count_table: Option<PathBuf>,
    pub length_histogram: Option<LengthHistogram>,
    pub log_path: PathBuf,
}

impl PipelineResult {
    /// Rebuilds the result of a finished job from the files it wrote, so
    /// jobs run in another process report the same way as local ones.
    pub fn from_job(job: &SampleJob) -> Result<PipelineResult, PipelineError> {
        let length_histogram = if job.lengths.exists() && job.task != SampleTask::CleanBeforeDenoising {
            Some(LengthHistogram::read(&job.lengths)?)
        } else {
            None
        };
        Ok(PipelineResult {
            sample_name: job.sample.name.clone(),
            filtered_fasta: job.filtered.clone(),
            artificial_combined_fasta: Some(job.artificial.clone()).filter(|p| p.exists()),
            count_table: Some(job.count.clone()).filter(|p| p.exists()),
            length_histogram,
            log_path: job.log.clone(),
        })
    }
}

/// Backing file of a stage handle: owned by the sample registry, or an input
/// the pipeline must not delete.
#[derive(Debug, Clone)]
enum Backing {
    Registered(TempFile),
    External(PathBuf),
}

impl Backing {
    fn path(&self) -> &Path {
        match self {
            Backing::Registered(file) => &file.path,
            Backing::External(path) => path,
        }
    }
}

#[derive(Debug)]
struct Merged {
    reads: Backing,
    unmerged: Option<(TempFile, TempFile)>,
}

#[derive(Debug)]
struct PrimerTrimmed(Backing);

#[derive(Debug)]
struct Filtered(Backing);

/// Artificially joined pairs, filtered and with the join tag set to Ns.
#[derive(Debug)]
struct ArtificialFiltered(PathBuf);

/// State machine over one sample. Owns the sample's temporary files.
pub struct SamplePipeline<'a> {
    config: &'a RunConfiguration,
    job: &'a SampleJob,
    registry: TempFileRegistry,
}

impl<'a> SamplePipeline<'a> {
    pub fn new(config: &'a RunConfiguration, job: &'a SampleJob) -> Result<Self, PipelineError> {
        let registry = TempFileRegistry::new(&job.work_dir, &format!("{}_", job.sample.name), config.debug)?;
        Ok(SamplePipeline { config, job, registry })
    }

    /// Runs the job's task. The sample's temporary files are removed on
    /// every exit path unless the run is in debug mode.
    pub async fn run(mut self) -> Result<PipelineResult, PipelineError> {
        info!("Processing sample {} ({:?})", self.job.sample.name, self.job.task);
        let outcome = match self.job.task {
            SampleTask::Preprocess => self.preprocess().await,
            SampleTask::CleanBeforeDenoising => self.clean_before_denoising().await,
            SampleTask::AfterDenoising => self.after_denoising().await,
        };
        let cleanup = self.registry.delete_all();
        outcome?;
        cleanup?;
        debug!("Sample {} done", self.job.sample.name);
        PipelineResult::from_job(self.job)
    }

    fn temp(&mut self, suffix: &str) -> Result<TempFile, PipelineError> {
        self.registry.add(&format!("{}{}", self.job.sample.name, suffix))
    }

    async fn submit(&self, tool: Tool) -> Result<(), PipelineError> {
        CommandInvocation::new(tool, self.config).submit(&self.job.log).await
    }

    fn write_header(&self, with_count: bool, truncate: bool) -> Result<(), PipelineError> {
        let sample = &self.job.sample;
        let mut header = String::from("##Sample\n");
        match &sample.read2 {
            Some(r2) => header.push_str(&format!("R1 : {}\nR2 : {}\n", sample.read1.display(), r2.display())),
            None => header.push_str(&format!("Contiged file : {}\n", sample.read1.display())),
        }
        header.push_str(&format!("Sample name : {}\n", sample.name));
        if with_count {
            header.push_str(&format!("nb seq before process : {}\n", count_sequences(&sample.read1)?));
        }
        header.push_str("##Commands\n");
        if truncate {
            fs::write(&self.job.log, header)?;
        } else {
            append_to_log(&self.job.log, &header)?;
        }
        Ok(())
    }

    async fn preprocess(&mut self) -> Result<(), PipelineError> {
        self.write_header(true, true)?;
        let merged = self.merge().await?;
        let trimmed = self.trim_primers(&merged).await?;
        let filtered = self.filter(trimmed, Some(0)).await?;
        self.record_lengths(merged.reads.path(), filtered.0.path(), None)?;

        let artificial = match (&merged.unmerged, self.config.keep_unmerged) {
            (Some(unmerged), true) => Some(self.artificial_branch(unmerged, true, Some(0)).await?),
            _ => None,
        };
        self.dereplicate(&filtered, artificial.as_ref(), None).await
    }

    async fn clean_before_denoising(&mut self) -> Result<(), PipelineError> {
        self.write_header(true, true)?;
        let job = self.job;
        let sample = &job.sample;
        let r2 = sample
            .read2
            .clone()
            .ok_or_else(|| PipelineError::config(format!("sample {} has no R2 file", sample.name)))?;
        let out_r2 = job
            .filtered_r2
            .clone()
            .ok_or_else(|| PipelineError::config(format!("no cleaned R2 path for sample {}", sample.name)))?;
        let (mut r1_in, mut r2_in) = (sample.read1.clone(), r2);

        if let Some(primers) = self.config.primers.clone() {
            let out_r1 = self.temp("_cutadapt_R1.fastq.gz")?;
            let out_r2 = self.temp("_cutadapt_R2.fastq.gz")?;
            let log = self.temp("_cutadapt.log")?;
            let err = self.temp("_cutadapt.err")?;
            self.submit(Tool::CutadaptPaired(cutadapt::PairedParams {
                r1: r1_in,
                r2: r2_in,
                out_r1: out_r1.path.clone(),
                out_r2: out_r2.path.clone(),
                log: log.path,
                err: err.path,
                five_prime: primers.five_prime,
                three_prime: primers.three_prime,
                before_denoising: true,
            }))
            .await?;
            r1_in = out_r1.path;
            r2_in = out_r2.path;
        }

        let filter_log = self.temp("_Nfilter.log")?;
        self.submit(Tool::MultiFilter(filter::Params {
            r1: r1_in,
            r2: Some(r2_in),
            out_r1: job.filtered.clone(),
            out_r2: Some(out_r2),
            min_length: Some(DENOISING_MIN_LENGTH),
            max_length: None,
            max_n: Some(0),
            tag: None,
            log: filter_log.path,
            quality_454: false,
        }))
        .await
    }

    async fn after_denoising(&mut self) -> Result<(), PipelineError> {
        self.write_header(false, false)?;
        let merged = self.merge().await?;
        let keep_unmerged = self.config.keep_unmerged && merged.unmerged.is_some();

        // Without the side branch the filter writes the sample output directly.
        let target = if keep_unmerged {
            None
        } else {
            Some(self.job.filtered.clone())
        };
        // Primers were removed before denoising.
        let filtered = self.filter_into(PrimerTrimmed(merged.reads.clone()), None, target).await?;
        self.record_lengths(merged.reads.path(), filtered.0.path(), Some(SIZE_SEPARATOR))?;

        if let (Some(unmerged), true) = (&merged.unmerged, keep_unmerged) {
            let artificial = self.artificial_branch(unmerged, false, None).await?;
            self.dereplicate(&filtered, Some(&artificial), Some(SIZE_SEPARATOR)).await?;
        }
        Ok(())
    }

    /// RAW -> MERGED. Contiged input passes through untouched.
    async fn merge(&mut self) -> Result<Merged, PipelineError> {
        let sample = self.job.sample.clone();
        let (merge, r2) = match (&self.config.merge, &sample.read2) {
            (Some(merge), Some(r2)) => (merge.clone(), r2.clone()),
            _ => return Ok(Merged { reads: Backing::External(sample.read1.clone()), unmerged: None }),
        };

        let (assembled, unmerged_r1, unmerged_r2, report) = match merge.software {
            MergeSoftware::Vsearch => (
                self.temp("_vsearch.assembled.fastq")?,
                self.temp("_vsearch.unassembled_R1.fastq")?,
                self.temp("_vsearch.unassembled_R2.fastq")?,
                self.temp("_vsearch.log")?,
            ),
            MergeSoftware::Flash => {
                let files = (
                    self.temp("_flash.extendedFrags.fastq.gz")?,
                    self.temp("_flash.notCombined_1.fastq.gz")?,
                    self.temp("_flash.notCombined_2.fastq.gz")?,
                    self.temp("_flash.stderr")?,
                );
                for extra in ["hist", "histogram", "hist.outie", "hist.innie", "histogram.outie", "histogram.innie"] {
                    self.temp(&format!("_flash.{}", extra))?;
                }
                files
            }
            MergeSoftware::Pear => {
                let files = (
                    self.temp("_pear.assembled.fastq")?,
                    self.temp("_pear.unassembled.forward.fastq")?,
                    self.temp("_pear.unassembled.reverse.fastq")?,
                    self.temp("_pear.log")?,
                );
                self.temp("_pear.discarded.fastq")?;
                files
            }
        };
        let prefix = self.registry.dir().join(format!("{}_{}", sample.name, merge_prefix(merge.software)));
        let tool = merge_tool(self.config, &sample.read1, &r2, &prefix, &report.path)?;
        self.submit(tool).await?;

        Ok(Merged { reads: Backing::Registered(assembled), unmerged: Some((unmerged_r1, unmerged_r2)) })
    }

    /// MERGED -> PRIMER_TRIMMED.
    async fn trim_primers(&mut self, merged: &Merged) -> Result<PrimerTrimmed, PipelineError> {
        let primers = match &self.config.primers {
            Some(primers) => primers.clone(),
            None => return Ok(PrimerTrimmed(merged.reads.clone())),
        };
        let trimmed = self.temp("_cutadapt.fastq.gz")?;
        let log_3prim = self.temp("_cutadapt_3prim_log.txt")?;
        let err_3prim = self.temp("_cutadapt_3prim_err.txt")?;

        if self.config.sequencer == Sequencer::Roche454 {
            // remove454Adapt.py picks its parser from the extension
            let suffix = if is_gzipped(merged.reads.path())? { "_454.fastq.gz" } else { "_454.fastq" };
            let renamed = self.temp(suffix)?;
            fs::copy(merged.reads.path(), &renamed.path)?;
            self.submit(Tool::Remove454Primers {
                input: renamed.path,
                output: trimmed.path.clone(),
                log: log_3prim.path,
                err: err_3prim.path,
                primers,
                min_length: self.config.min_amplicon_size,
            })
            .await?;
        } else {
            let five_trimmed = self.temp("_cutadapt_5prim_trim.fastq.gz")?;
            let log_5prim = self.temp("_cutadapt_5prim_log.txt")?;
            let err_5prim = self.temp("_cutadapt_5prim_err.txt")?;
            let sequencer = self.config.sequencer;
            self.submit(Tool::Cutadapt(cutadapt::SingleParams::new(
                cutadapt::End::Five,
                merged.reads.path(),
                &five_trimmed.path,
                &log_5prim.path,
                &err_5prim.path,
                &primers,
                sequencer,
            )))
            .await?;
            self.submit(Tool::Cutadapt(cutadapt::SingleParams::new(
                cutadapt::End::Three,
                &five_trimmed.path,
                &trimmed.path,
                &log_3prim.path,
                &err_3prim.path,
                &primers,
                sequencer,
            )))
            .await?;
        }
        Ok(PrimerTrimmed(Backing::Registered(trimmed)))
    }

    /// PRIMER_TRIMMED -> LENGTH_N_FILTERED, into a temporary FASTA.
    async fn filter(&mut self, trimmed: PrimerTrimmed, max_n: Option<usize>) -> Result<Filtered, PipelineError> {
        self.filter_into(trimmed, max_n, None).await
    }

    async fn filter_into(
        &mut self,
        trimmed: PrimerTrimmed,
        max_n: Option<usize>,
        target: Option<PathBuf>,
    ) -> Result<Filtered, PipelineError> {
        let (min_length, max_length) = self.config.filter_length_window();
        let output = match target {
            Some(path) => Backing::External(path),
            None => Backing::Registered(self.temp("_N_and_length_filter.fasta")?),
        };
        let log = self.temp("_N_and_length_filter_log.txt")?;
        self.submit(Tool::MultiFilter(filter::Params {
            r1: trimmed.0.path().to_path_buf(),
            r2: None,
            out_r1: output.path().to_path_buf(),
            out_r2: None,
            min_length: Some(min_length),
            max_length: Some(max_length),
            max_n,
            tag: None,
            log: log.path,
            quality_454: self.config.sequencer == Sequencer::Roche454,
        }))
        .await?;
        Ok(Filtered(output))
    }

    /// Side branch: join the unmerged pairs with an X spacer, filter them,
    /// then turn the spacer into Ns.
    async fn artificial_branch(
        &mut self,
        unmerged: &(TempFile, TempFile),
        trim_primers: bool,
        max_n: Option<usize>,
    ) -> Result<ArtificialFiltered, PipelineError> {
        let (mut r1, mut r2) = (unmerged.0.path.clone(), unmerged.1.path.clone());
        if let (true, Some(primers)) = (trim_primers, self.config.primers.clone()) {
            let out_r1 = self.temp("_uncomb_cutadapt_paired_trim_R1.fastq.gz")?;
            let out_r2 = self.temp("_uncomb_cutadapt_paired_trim_R2.fastq.gz")?;
            let log = self.temp("_uncomb_cutadapt_paired_log.txt")?;
            let err = self.temp("_uncomb_cutadapt_paired_err.txt")?;
            self.submit(Tool::CutadaptPaired(cutadapt::PairedParams {
                r1,
                r2,
                out_r1: out_r1.path.clone(),
                out_r2: out_r2.path.clone(),
                log: log.path,
                err: err.path,
                five_prime: primers.five_prime,
                three_prime: primers.three_prime,
                before_denoising: false,
            }))
            .await?;
            r1 = out_r1.path;
            r2 = out_r2.path;
        }

        let join_tag = JOIN_TAG_CHAR.to_string().repeat(SPACER_LENGTH);
        let combined = self.temp("_artificial_combined.fastq.gz")?;
        self.submit(Tool::Combine { r1, r2, join_tag: join_tag.clone(), output: combined.path.clone() })
            .await?;

        let (min_length, max_length) = self.config.filter_length_window();
        let art_filtered = self.temp("_art_N_filter.fasta")?;
        let art_log = self.temp("_art_N_filter_log.txt")?;
        self.submit(Tool::MultiFilter(filter::Params {
            r1: combined.path,
            r2: None,
            out_r1: art_filtered.path.clone(),
            out_r2: None,
            min_length: Some(min_length),
            max_length: Some(max_length),
            max_n,
            tag: None,
            log: art_log.path,
            quality_454: false,
        }))
        .await?;

        self.submit(Tool::ReplaceJoinTag {
            input: art_filtered.path,
            split_tag: join_tag,
            join_tag: SPACER_CHAR.to_string().repeat(SPACER_LENGTH),
            output: self.job.artificial.clone(),
        })
        .await?;
        Ok(ArtificialFiltered(self.job.artificial.clone()))
    }

    /// LENGTH_N_FILTERED -> DEREPLICATED, over the filtered reads and the
    /// artificially joined ones when present.
    async fn dereplicate(
        &mut self,
        filtered: &Filtered,
        artificial: Option<&ArtificialFiltered>,
        size_separator: Option<&str>,
    ) -> Result<(), PipelineError> {
        self.submit(Tool::DerepBySample {
            inputs: derep_inputs(filtered.0.path(), artificial.map(|a| a.0.as_path())),
            output: self.job.filtered.clone(),
            count: self.job.count.clone(),
            size_separator: size_separator.map(str::to_string),
        })
        .await
    }

    fn record_lengths(&self, before: &Path, after: &Path, size_separator: Option<&str>) -> Result<(), PipelineError> {
        let histogram = LengthHistogram {
            before: length_histogram(before, size_separator)?,
            after: length_histogram(after, size_separator)?,
        };
        histogram.write(&self.job.lengths)
    }
}

fn merge_prefix(software: MergeSoftware) -> &'static str {
    match software {
        MergeSoftware::Vsearch => "vsearch",
        MergeSoftware::Flash => "flash",
        MergeSoftware::Pear => "pear",
    }
}

/// Dereplication input of a sample: its filtered reads, plus the
/// artificially joined pairs when the side branch ran.
pub fn derep_inputs(filtered: &Path, artificial: Option<&Path>) -> Vec<PathBuf> {
    let mut inputs = vec![filtered.to_path_buf()];
    if let Some(artificial) = artificial {
        inputs.push(artificial.to_path_buf());
    }
    inputs
}
