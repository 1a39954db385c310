use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::cli::args::{ClusteringArgs, Command, CommonArgs, InputArgs, OutputArgs};
use crate::cli::{MergeSoftware, QualityScale};
use crate::config::defs::{PipelineError, MAX_OVERLAP_SLACK, MIN_OVERLAP_FLOOR, PEAR_ASSEMBLY_MARGIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sequencer {
    #[default]
    Illumina,
    Roche454,
    LongReads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Clustering {
    Swarm {
        distance: usize,
        fastidious: bool,
        denoising: bool,
    },
    Dada2 {
        pseudo_pooling: bool,
    },
}

impl Default for Clustering {
    fn default() -> Self {
        Clustering::Swarm { distance: 1, fastidious: false, denoising: false }
    }
}

/// Read pair merging parameters. Absent from the configuration when the
/// reads are already contiged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSettings {
    pub software: MergeSoftware,
    pub r1_size: usize,
    pub r2_size: usize,
    pub expected_amplicon_size: Option<usize>,
    pub mismatch_rate: f64,
    pub quality_scale: QualityScale,
}

impl MergeSettings {
    /// Minimum overlap shared by all merge tools.
    ///
    /// # Arguments
    ///
    /// * `max_amplicon_size` - Largest accepted amplicon, primers included.
    ///
    /// # Returns
    /// max(R1 + R2 - max_amplicon_size, 10)
    pub fn min_overlap(&self, max_amplicon_size: usize) -> i64 {
        let reads = (self.r1_size + self.r2_size) as i64;
        (reads - max_amplicon_size as i64).max(MIN_OVERLAP_FLOOR)
    }

    /// Maximum expected overlap passed to flash.
    pub fn max_overlap(&self, min_amplicon_size: usize, expected_amplicon_size: usize) -> i64 {
        let reads = (self.r1_size + self.r2_size) as i64;
        let expected = expected_amplicon_size as i64;
        let slack = ((expected - min_amplicon_size as i64) / 2).min(MAX_OVERLAP_SLACK);
        reads - expected + slack
    }

    /// (min, max) assembly lengths passed to pear.
    pub fn assembly_bounds(&self, min_amplicon_size: usize, max_amplicon_size: usize) -> (usize, usize) {
        let reads = (self.r1_size + self.r2_size).saturating_sub(PEAR_ASSEMBLY_MARGIN);
        (min_amplicon_size, max_amplicon_size.min(reads))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primers {
    pub five_prime: String,
    pub three_prime: String,
}

impl Primers {
    pub fn total_len(&self) -> usize {
        self.five_prime.len() + self.three_prime.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPaths {
    pub dereplicated: PathBuf,
    pub count: PathBuf,
    pub biom: PathBuf,
    pub fasta: PathBuf,
    pub composition: PathBuf,
    pub summary: PathBuf,
    pub log: PathBuf,
}

impl Default for OutputPaths {
    fn default() -> Self {
        OutputPaths {
            dereplicated: PathBuf::from("preprocess.fasta"),
            count: PathBuf::from("preprocess_counts.tsv"),
            biom: PathBuf::from("clustering_abundance.biom"),
            fasta: PathBuf::from("sequences.fasta"),
            composition: PathBuf::from("clustering_swarms_composition.tsv"),
            summary: PathBuf::from("preprocess.html"),
            log: PathBuf::from("preprocess.log"),
        }
    }
}

impl From<&OutputArgs> for OutputPaths {
    fn from(args: &OutputArgs) -> Self {
        OutputPaths {
            dereplicated: args.output_dereplicated.clone(),
            count: args.output_count.clone(),
            biom: args.output_biom.clone(),
            fasta: args.output_fasta.clone(),
            composition: args.output_compo.clone(),
            summary: args.summary.clone(),
            log: args.log_file.clone(),
        }
    }
}

/// Where the samples come from, before any file is touched.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleSource {
    Archive(PathBuf),
    Files {
        r1: Vec<PathBuf>,
        r2: Option<Vec<PathBuf>>,
        names: Option<Vec<String>>,
    },
}

/// Resolved, read-only options of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub sequencer: Sequencer,
    pub clustering: Clustering,
    pub merge: Option<MergeSettings>,
    pub keep_unmerged: bool,
    pub min_amplicon_size: usize,
    pub max_amplicon_size: usize,
    pub primers: Option<Primers>,
    pub nb_cpus: usize,
    pub debug: bool,
    pub tool_dir: Option<PathBuf>,
    pub outputs: OutputPaths,
    /// Non-fatal adjustments made while resolving options, reported in the run log.
    pub warnings: Vec<String>,
}

impl RunConfiguration {
    /// Resolves and validates the options of a sequencer subcommand.
    ///
    /// # Arguments
    ///
    /// * `command` - Parsed subcommand. `worker` is not a run command.
    ///
    /// # Returns
    /// The configuration and the unresolved sample source, or the first
    /// configuration error found.
    pub fn from_command(command: &Command) -> Result<(RunConfiguration, SampleSource), PipelineError> {
        match command {
            Command::Illumina(args) => {
                let contiged = args.already_contiged;
                let source = sample_source(&args.common.inputs, !contiged)?;
                let primers = resolve_primers(&args.common, args.without_primers)?;

                let merge = if contiged {
                    if args.keep_unmerged {
                        return Err(PipelineError::config("--already-contiged and --keep-unmerged cannot be used together."));
                    }
                    None
                } else {
                    let (r1_size, r2_size) = match (args.r1_size, args.r2_size) {
                        (Some(r1), Some(r2)) => (r1, r2),
                        _ => return Err(PipelineError::config("'--R1-size/--R2-size' or '--already-contiged' must be set.")),
                    };
                    if args.merge_software == MergeSoftware::Flash && args.expected_amplicon_size.is_none() {
                        return Err(PipelineError::config("With '--merge-software flash' you need to set the parameter '--expected-amplicon-size'."));
                    }
                    Some(MergeSettings {
                        software: args.merge_software,
                        r1_size,
                        r2_size,
                        expected_amplicon_size: args.expected_amplicon_size,
                        mismatch_rate: args.mismatch_rate,
                        quality_scale: args.quality_scale,
                    })
                };
                if !(0.0..=1.0).contains(&args.mismatch_rate) {
                    return Err(PipelineError::config("--mismatch-rate must be between 0 and 1."));
                }

                let mut warnings = Vec::new();
                let clustering = if args.mode.dada2 {
                    if merge.is_none() {
                        return Err(PipelineError::config("--dada2 needs paired reads: it cannot be used with --already-contiged."));
                    }
                    Clustering::Dada2 { pseudo_pooling: args.pseudo_pooling }
                } else {
                    swarm_clustering(&args.clustering, &mut warnings)?
                };

                let config = base_config(Sequencer::Illumina, clustering, merge, args.keep_unmerged, primers, &args.common, warnings)?;
                Ok((config, source))
            }
            Command::Roche454(args) => {
                let source = sample_source(&args.common.inputs, false)?;
                let primers = resolve_primers(&args.common, false)?;
                let mut warnings = Vec::new();
                let clustering = swarm_clustering(&args.clustering, &mut warnings)?;
                let config = base_config(Sequencer::Roche454, clustering, None, false, primers, &args.common, warnings)?;
                Ok((config, source))
            }
            Command::Longreads(args) => {
                let source = sample_source(&args.common.inputs, false)?;
                let primers = resolve_primers(&args.common, args.without_primers)?;
                let mut warnings = Vec::new();
                let clustering = swarm_clustering(&args.clustering, &mut warnings)?;
                let config = base_config(Sequencer::LongReads, clustering, None, false, primers, &args.common, warnings)?;
                Ok((config, source))
            }
            Command::Worker(_) => Err(PipelineError::config("The worker command does not describe a run.")),
        }
    }

    /// Length window applied after primer removal.
    pub fn filter_length_window(&self) -> (usize, usize) {
        let primers_len = self.primers.as_ref().map(Primers::total_len).unwrap_or(0);
        (
            self.min_amplicon_size.saturating_sub(primers_len),
            self.max_amplicon_size.saturating_sub(primers_len),
        )
    }

    /// Locates an external program, preferring `--tool-dir` over `PATH`.
    pub fn resolve_program(&self, tag: &str) -> PathBuf {
        if let Some(dir) = &self.tool_dir {
            let candidate = dir.join(tag);
            if candidate.is_file() {
                return candidate;
            }
        }
        PathBuf::from(tag)
    }

    pub fn is_contiged(&self) -> bool {
        self.merge.is_none()
    }

    pub fn is_dada2(&self) -> bool {
        matches!(self.clustering, Clustering::Dada2 { .. })
    }
}

fn base_config(
    sequencer: Sequencer,
    clustering: Clustering,
    merge: Option<MergeSettings>,
    keep_unmerged: bool,
    primers: Option<Primers>,
    common: &CommonArgs,
    warnings: Vec<String>,
) -> Result<RunConfiguration, PipelineError> {
    if common.min_amplicon_size > common.max_amplicon_size {
        return Err(PipelineError::config(format!(
            "--min-amplicon-size ({}) must not exceed --max-amplicon-size ({}).",
            common.min_amplicon_size, common.max_amplicon_size
        )));
    }
    if common.nb_cpus < 1 {
        return Err(PipelineError::config("--nb-cpus must be at least 1."));
    }
    if let Some(dir) = &common.tool_dir {
        if !dir.is_dir() {
            return Err(PipelineError::config(format!("Tool directory {} does not exist.", dir.display())));
        }
    }

    Ok(RunConfiguration {
        sequencer,
        clustering,
        merge,
        keep_unmerged,
        min_amplicon_size: common.min_amplicon_size,
        max_amplicon_size: common.max_amplicon_size,
        primers,
        nb_cpus: common.nb_cpus,
        debug: common.debug,
        tool_dir: common.tool_dir.clone(),
        outputs: OutputPaths::from(&common.outputs),
        warnings,
    })
}

fn swarm_clustering(args: &ClusteringArgs, warnings: &mut Vec<String>) -> Result<Clustering, PipelineError> {
    if args.denoising && args.fastidious {
        return Err(PipelineError::config("--fastidious and --denoising are mutually exclusive."));
    }
    if args.distance > 1 && args.fastidious {
        return Err(PipelineError::config("--fastidious is not allowed with d>1."));
    }
    if args.distance == 0 {
        return Err(PipelineError::config("--distance must be at least 1."));
    }
    let mut denoising = args.denoising;
    if denoising && args.distance == 1 {
        let msg = "using the denoising option with a distance of 1 is useless. The denoising option is cancelled".to_string();
        warn!("{}", msg);
        warnings.push(msg);
        denoising = false;
    }
    Ok(Clustering::Swarm { distance: args.distance, fastidious: args.fastidious, denoising })
}

fn resolve_primers(common: &CommonArgs, without_primers: bool) -> Result<Option<Primers>, PipelineError> {
    if without_primers {
        if common.five_prim_primer.is_some() || common.three_prim_primer.is_some() {
            return Err(PipelineError::config(
                "The option '--without-primers' cannot be used with '--five-prim-primer' and '--three-prim-primer'.",
            ));
        }
        return Ok(None);
    }
    let primers = match (&common.five_prim_primer, &common.three_prim_primer) {
        (Some(five), Some(three)) => Primers { five_prime: five.clone(), three_prime: three.clone() },
        _ => return Err(PipelineError::config("'--five-prim-primer/--three-prim-primer' or '--without-primers' must be set.")),
    };
    if common.min_amplicon_size <= primers.total_len() {
        return Err(PipelineError::config(format!(
            "The minimum length of the amplicon (--min-amplicon-size) must be greater than the size of the two primers, i.e {}.",
            primers.total_len()
        )));
    }
    Ok(Some(primers))
}

fn sample_source(inputs: &InputArgs, r2_required: bool) -> Result<SampleSource, PipelineError> {
    if let Some(archive) = &inputs.input_archive {
        if inputs.input_r1.is_some() {
            return Err(PipelineError::config("With '--input-archive' you cannot set '--input-R1'."));
        }
        if inputs.input_r2.is_some() {
            return Err(PipelineError::config("With '--input-archive' you cannot set '--input-R2'."));
        }
        if inputs.samples_names.is_some() {
            return Err(PipelineError::config("With '--input-archive' you cannot set '--samples-names'."));
        }
        return Ok(SampleSource::Archive(archive.clone()));
    }

    let r1 = inputs
        .input_r1
        .clone()
        .ok_or_else(|| PipelineError::config("'--input-R1' or '--input-archive' is required."))?;

    let r2 = if r2_required {
        let r2 = inputs
            .input_r2
            .clone()
            .ok_or_else(|| PipelineError::config("'--input-R2' is required unless reads are already contiged."))?;
        if r2.len() != r1.len() {
            return Err(PipelineError::config(format!(
                "{} R1 files but {} R2 files were given.",
                r1.len(),
                r2.len()
            )));
        }
        Some(r2)
    } else {
        None
    };

    if let Some(names) = &inputs.samples_names {
        if names.len() != r1.len() {
            return Err(PipelineError::config("With '--samples-names' all samples must have a name."));
        }
        check_unique_names(names)?;
    }

    Ok(SampleSource::Files { r1, r2, names: inputs.samples_names.clone() })
}

/// Fails on the first set of duplicated sample names.
pub fn check_unique_names(names: &[String]) -> Result<(), PipelineError> {
    let mut seen = HashSet::new();
    let mut duplicated: Vec<&str> = names
        .iter()
        .filter(|name| !seen.insert(name.as_str()))
        .map(String::as_str)
        .collect();
    if duplicated.is_empty() {
        return Ok(());
    }
    duplicated.sort_unstable();
    duplicated.dedup();
    Err(PipelineError::config(format!(
        "Samples names must be unique (duplicated: \"{}\").",
        duplicated.join("\", \"")
    )))
}

/// Default sample name: file basename up to the first dot.
pub fn default_sample_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy())
        .and_then(|name| name.split('.').next().map(str::to_string))
        .unwrap_or_default()
}
