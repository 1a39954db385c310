use std::path::PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeSoftware {
    #[default]
    Vsearch,
    Flash,
    Pear,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityScale {
    #[default]
    #[value(name = "33")]
    Phred33,
    #[value(name = "64")]
    Phred64,
}

impl QualityScale {
    pub fn offset(&self) -> u8 {
        match self {
            QualityScale::Phred33 => 33,
            QualityScale::Phred64 => 64,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "amplicon-preprocess", version, about = "Pre-process amplicons to use reads in diversity analysis.")]
pub struct Arguments {
    #[arg(short = 'v', long = "verbose", action, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Illumina sequencers.
    Illumina(IlluminaArgs),

    /// 454 sequencers.
    #[command(name = "454")]
    Roche454(Roche454Args),

    /// Long-reads sequencers.
    Longreads(LongReadsArgs),

    /// Runs one bucket of samples described by a manifest (spawned by the dispatcher).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IlluminaArgs {
    #[arg(long = "merge-software", default_value = "vsearch", value_enum, help = "Software used to merge paired reads.")]
    pub merge_software: MergeSoftware,

    #[arg(long = "keep-unmerged", action, help = "In case of uncontiged paired reads, keep unmerged, and artificially combined them with 100 Ns.")]
    pub keep_unmerged: bool,

    #[arg(long = "expected-amplicon-size", help = "The expected size for the majority of the amplicons (with primers), if using Flash as read pair merge software.")]
    pub expected_amplicon_size: Option<usize>,

    #[arg(long = "without-primers", action, help = "The reads do not contain the PCR primers (custom sequencing primers).")]
    pub without_primers: bool,

    #[arg(long = "R1-size", help = "The read1 size.")]
    pub r1_size: Option<usize>,

    #[arg(long = "R2-size", help = "The read2 size.")]
    pub r2_size: Option<usize>,

    #[arg(long = "mismatch-rate", default_value_t = 0.1, help = "Maximum mismatch rate in overlap region, between 0 and 1.")]
    pub mismatch_rate: f64,

    #[arg(long = "quality-scale", default_value = "33", value_enum, help = "The phred base quality scale, if using Vsearch as read pair merge software.")]
    pub quality_scale: QualityScale,

    #[arg(long = "already-contiged", action, help = "Reads 1 and Reads 2 are already contiged by pair (one file by sample).")]
    pub already_contiged: bool,

    #[command(flatten)]
    pub mode: ClusteringModeArgs,

    #[arg(long = "pseudo-pooling", action, help = "Perform dada2 pseudo-pooling to reduce inconvenients of independent sample processing.")]
    pub pseudo_pooling: bool,

    #[command(flatten)]
    pub clustering: ClusteringArgs,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct Roche454Args {
    #[command(flatten)]
    pub clustering: ClusteringArgs,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LongReadsArgs {
    #[arg(long = "without-primers", action, help = "The reads do not contain the PCR primers (custom sequencing primers).")]
    pub without_primers: bool,

    #[command(flatten)]
    pub clustering: ClusteringArgs,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long)]
    pub manifest: PathBuf,
}

#[derive(Args, Debug, Clone, Default)]
#[group(required = true, multiple = false)]
pub struct ClusteringModeArgs {
    #[arg(long, action, help = "Build OTUs from reads.")]
    pub swarm: bool,

    #[arg(long, action, help = "Build ASVs from reads.")]
    pub dada2: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClusteringArgs {
    #[arg(short = 'n', long, action, help = "Denoise data by clustering read with distance=1 before perform real clustering.")]
    pub denoising: bool,

    #[arg(short = 'd', long, default_value_t = 1, help = "Maximum distance between sequences in each aggregation step.")]
    pub distance: usize,

    #[arg(long, action, help = "Use the fastidious option of swarm to refine OTU (only with d=1).")]
    pub fastidious: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long = "min-amplicon-size", required = true, help = "The minimum size for the amplicons (with primers).")]
    pub min_amplicon_size: usize,

    #[arg(long = "max-amplicon-size", required = true, help = "The maximum size for the amplicons (with primers).")]
    pub max_amplicon_size: usize,

    #[arg(long = "five-prim-primer", help = "The 5' primer sequence (wildcards are accepted).")]
    pub five_prim_primer: Option<String>,

    #[arg(long = "three-prim-primer", help = "The 3' primer sequence (wildcards are accepted).")]
    pub three_prim_primer: Option<String>,

    #[arg(short = 'p', long = "nb-cpus", default_value_t = 1, help = "The maximum number of CPUs used.")]
    pub nb_cpus: usize,

    #[arg(long, action, help = "Keep temporary files to debug program.")]
    pub debug: bool,

    #[arg(long = "tool-dir", env = "AMPLICON_TOOL_DIR", help = "Directory searched for external tools before PATH.")]
    pub tool_dir: Option<PathBuf>,

    #[command(flatten)]
    pub inputs: InputArgs,

    #[command(flatten)]
    pub outputs: OutputArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct InputArgs {
    #[arg(long = "input-archive", help = "The tar file containing the sequence files of each sample.")]
    pub input_archive: Option<PathBuf>,

    #[arg(long = "input-R1", num_args = 1.., help = "The R1 sequence file for each sample (format: fastq).")]
    pub input_r1: Option<Vec<PathBuf>>,

    #[arg(long = "input-R2", num_args = 1.., help = "The R2 sequence file for each sample (format: fastq).")]
    pub input_r2: Option<Vec<PathBuf>>,

    #[arg(long = "samples-names", num_args = 1.., value_parser = sample_name_type, help = "The sample name for each R1/R2-files.")]
    pub samples_names: Option<Vec<String>>,
}

#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    #[arg(long = "output-dereplicated", default_value = "preprocess.fasta", help = "FASTA file with unique sequences, IDs ended with ';size=N'.")]
    pub output_dereplicated: PathBuf,

    #[arg(short = 'c', long = "output-count", default_value = "preprocess_counts.tsv", help = "TSV file with count by sample for each unique sequence.")]
    pub output_count: PathBuf,

    #[arg(short = 'b', long = "output-biom", default_value = "clustering_abundance.biom", help = "Abundance by sample for each OTU or ASV (format: BIOM).")]
    pub output_biom: PathBuf,

    #[arg(long = "output-fasta", default_value = "sequences.fasta", help = "Sequence of each OTU or ASV (format: FASTA).")]
    pub output_fasta: PathBuf,

    #[arg(long = "output-compo", default_value = "clustering_swarms_composition.tsv", help = "Composition of each cluster (format: TSV).")]
    pub output_compo: PathBuf,

    #[arg(short = 's', long = "summary", default_value = "preprocess.html", help = "The HTML file containing the graphs.")]
    pub summary: PathBuf,

    #[arg(short = 'l', long = "log-file", default_value = "preprocess.log", help = "Information on executed commands.")]
    pub log_file: PathBuf,
}

/// Sample names end up in file names and TSV headers.
fn sample_name_type(value: &str) -> Result<String, String> {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err("A sample name must not contain white spaces.".to_string());
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_illumina() {
        let args = Arguments::try_parse_from([
            "amplicon-preprocess", "illumina", "--swarm",
            "--min-amplicon-size", "44", "--max-amplicon-size", "490",
            "--five-prim-primer", "GGCGVACGGGTGAGTAA", "--three-prim-primer", "GTGCCAGCNGCNGCGG",
            "--R1-size", "267", "--R2-size", "266",
            "--input-R1", "a_R1.fastq.gz", "b_R1.fastq.gz",
            "--input-R2", "a_R2.fastq.gz", "b_R2.fastq.gz",
            "-p", "4",
        ]).unwrap();
        match args.command {
            Command::Illumina(ill) => {
                assert!(ill.mode.swarm);
                assert_eq!(ill.merge_software, MergeSoftware::Vsearch);
                assert_eq!(ill.quality_scale, QualityScale::Phred33);
                assert_eq!(ill.common.nb_cpus, 4);
                assert_eq!(ill.common.inputs.input_r1.unwrap().len(), 2);
                assert_eq!(ill.clustering.distance, 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_swarm_and_dada2_are_exclusive() {
        let res = Arguments::try_parse_from([
            "amplicon-preprocess", "illumina", "--swarm", "--dada2",
            "--min-amplicon-size", "44", "--max-amplicon-size", "490",
            "--input-R1", "a.fastq",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_sample_name_whitespace_rejected() {
        let res = Arguments::try_parse_from([
            "amplicon-preprocess", "454",
            "--min-amplicon-size", "44", "--max-amplicon-size", "490",
            "--input-R1", "a.fastq", "--samples-names", "bad name",
        ]);
        assert!(res.is_err());
        assert!(sample_name_type("good_name").is_ok());
    }

    #[test]
    fn test_quality_scale_values() {
        assert_eq!(QualityScale::Phred64.offset(), 64);
        let args = Arguments::try_parse_from([
            "amplicon-preprocess", "illumina", "--dada2", "--quality-scale", "64",
            "--min-amplicon-size", "44", "--max-amplicon-size", "490",
            "--input-R1", "a.fastq",
        ]).unwrap();
        if let Command::Illumina(ill) = args.command {
            assert_eq!(ill.quality_scale, QualityScale::Phred64);
        } else {
            panic!("expected illumina");
        }
    }
}
