/// Catalogue of the external programs driven by the pipeline.
///
/// Each variant carries the typed parameters of one call. Argument vectors
/// are assembled from those parameters only, never from a shell string.

use std::path::{Path, PathBuf};

use crate::config::defs::*;
use crate::config::run::{MergeSettings, Primers, RunConfiguration, Sequencer};
use crate::utils::file::append_to_log;
use crate::utils::fastx::count_sequences;

/// Where the version text of a program is printed, and which token holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSource {
    /// Second whitespace token of stdout (`PEAR v0.9.11 ...`).
    StdoutSecondToken,
    /// Second token of the first comma field of stderr (`vsearch v2.21.1_linux, 16GB RAM`).
    StderrBeforeComma,
    /// Second whitespace token of stderr (`Swarm 3.1.0 ...`).
    StderrSecondToken,
    /// Whole stdout, untouched.
    StdoutRaw,
    /// Whole stdout, trimmed.
    StdoutTrimmed,
}

impl VersionSource {
    /// Extracts the version from captured outputs.
    ///
    /// # Returns
    /// None when the expected token is missing.
    pub fn parse(&self, stdout: &str, stderr: &str) -> Option<String> {
        let version = match self {
            VersionSource::StdoutSecondToken => stdout.split_whitespace().nth(1)?.trim().to_string(),
            VersionSource::StderrBeforeComma => stderr.split(',').next()?.split_whitespace().nth(1)?.to_string(),
            VersionSource::StderrSecondToken => stderr.split_whitespace().nth(1)?.to_string(),
            VersionSource::StdoutRaw => stdout.to_string(),
            VersionSource::StdoutTrimmed => stdout.trim().to_string(),
        };
        if version.trim().is_empty() { None } else { Some(version) }
    }
}

/// Files receiving the captured streams of a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redirects {
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

fn s(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Reverse complement of an IUPAC sequence.
pub fn revcomp(seq: &str) -> String {
    seq.chars()
        .rev()
        .map(|c| match c {
            'A' => 'T', 'C' => 'G', 'G' => 'C', 'T' => 'A',
            'a' => 't', 'c' => 'g', 'g' => 'c', 't' => 'a',
            'R' => 'Y', 'Y' => 'R', 'M' => 'K', 'K' => 'M',
            'r' => 'y', 'y' => 'r', 'm' => 'k', 'k' => 'm',
            'V' => 'B', 'B' => 'V', 'H' => 'D', 'D' => 'H',
            'v' => 'b', 'b' => 'v', 'h' => 'd', 'd' => 'h',
            other => other,
        })
        .collect()
}

pub mod vsearch {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Params {
        pub r1: PathBuf,
        pub r2: PathBuf,
        pub out_prefix: PathBuf,
        pub log: PathBuf,
        pub min_overlap: i64,
        pub mismatch_rate: f64,
        pub quality_offset: u8,
    }

    impl Params {
        pub fn new(r1: &Path, r2: &Path, out_prefix: &Path, log: &Path, merge: &MergeSettings, max_amplicon_size: usize) -> Self {
            Params {
                r1: r1.to_path_buf(),
                r2: r2.to_path_buf(),
                out_prefix: out_prefix.to_path_buf(),
                log: log.to_path_buf(),
                min_overlap: merge.min_overlap(max_amplicon_size),
                mismatch_rate: merge.mismatch_rate,
                quality_offset: merge.quality_scale.offset(),
            }
        }

        pub fn assembled(&self) -> PathBuf {
            PathBuf::from(format!("{}.assembled.fastq", s(&self.out_prefix)))
        }
    }

    pub fn arg_generator(p: &Params) -> Vec<String> {
        let prefix = s(&p.out_prefix);
        vec![
            "--threads".to_string(), "1".to_string(),
            "--fastq_mergepairs".to_string(), s(&p.r1),
            "--reverse".to_string(), s(&p.r2),
            "--fastqout".to_string(), format!("{}.assembled.fastq", prefix),
            "--fastqout_notmerged_fwd".to_string(), format!("{}.unassembled_R1.fastq", prefix),
            "--fastqout_notmerged_rev".to_string(), format!("{}.unassembled_R2.fastq", prefix),
            "--fastq_allowmergestagger".to_string(),
            "--fastq_ascii".to_string(), p.quality_offset.to_string(),
            "--fastq_maxdiffpct".to_string(), (p.mismatch_rate * 100.0).to_string(),
            "--fastq_minovlen".to_string(), p.min_overlap.to_string(),
        ]
    }
}

pub mod flash {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Params {
        pub r1: PathBuf,
        pub r2: PathBuf,
        pub out_prefix: PathBuf,
        pub stderr: PathBuf,
        pub min_overlap: i64,
        pub max_overlap: i64,
        pub mismatch_rate: f64,
    }

    impl Params {
        pub fn new(
            r1: &Path,
            r2: &Path,
            out_prefix: &Path,
            stderr: &Path,
            merge: &MergeSettings,
            min_amplicon_size: usize,
            max_amplicon_size: usize,
            expected_amplicon_size: usize,
        ) -> Self {
            Params {
                r1: r1.to_path_buf(),
                r2: r2.to_path_buf(),
                out_prefix: out_prefix.to_path_buf(),
                stderr: stderr.to_path_buf(),
                min_overlap: merge.min_overlap(max_amplicon_size),
                max_overlap: merge.max_overlap(min_amplicon_size, expected_amplicon_size),
                mismatch_rate: merge.mismatch_rate,
            }
        }

        pub fn assembled(&self) -> PathBuf {
            PathBuf::from(format!("{}.extendedFrags.fastq.gz", s(&self.out_prefix)))
        }
    }

    pub fn arg_generator(p: &Params) -> Vec<String> {
        let out_dir = p
            .out_prefix
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map(s)
            .unwrap_or_else(|| ".".to_string());
        let prefix = p
            .out_prefix
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        vec![
            "--threads".to_string(), "1".to_string(),
            "--allow-outies".to_string(),
            "--min-overlap".to_string(), p.min_overlap.to_string(),
            "--max-overlap".to_string(), p.max_overlap.to_string(),
            "--max-mismatch-density".to_string(), p.mismatch_rate.to_string(),
            "--compress".to_string(),
            s(&p.r1),
            s(&p.r2),
            "--output-directory".to_string(), out_dir,
            "--output-prefix".to_string(), prefix,
        ]
    }
}

pub mod pear {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Params {
        pub r1: PathBuf,
        pub r2: PathBuf,
        pub out_prefix: PathBuf,
        pub log: PathBuf,
        pub min_overlap: i64,
        pub min_assembly: usize,
        pub max_assembly: usize,
    }

    impl Params {
        pub fn new(r1: &Path, r2: &Path, out_prefix: &Path, log: &Path, merge: &MergeSettings, min_amplicon_size: usize, max_amplicon_size: usize) -> Self {
            let (min_assembly, max_assembly) = merge.assembly_bounds(min_amplicon_size, max_amplicon_size);
            Params {
                r1: r1.to_path_buf(),
                r2: r2.to_path_buf(),
                out_prefix: out_prefix.to_path_buf(),
                log: log.to_path_buf(),
                min_overlap: merge.min_overlap(max_amplicon_size),
                min_assembly,
                max_assembly,
            }
        }

        pub fn assembled(&self) -> PathBuf {
            PathBuf::from(format!("{}.assembled.fastq", s(&self.out_prefix)))
        }
    }

    pub fn arg_generator(p: &Params) -> Vec<String> {
        vec![
            "--forward-fastq".to_string(), s(&p.r1),
            "--reverse-fastq".to_string(), s(&p.r2),
            "--output".to_string(), s(&p.out_prefix),
            "--min-overlap".to_string(), p.min_overlap.to_string(),
            "--max-assembly-length".to_string(), p.max_assembly.to_string(),
            "--min-assembly-length".to_string(), p.min_assembly.to_string(),
            "--keep-original".to_string(),
        ]
    }
}

pub mod cutadapt {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum End {
        Five,
        Three,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct SingleParams {
        pub end: End,
        pub input: PathBuf,
        pub output: PathBuf,
        pub log: PathBuf,
        pub err: PathBuf,
        pub primer: String,
        pub revcomp: bool,
    }

    impl SingleParams {
        pub fn new(end: End, input: &Path, output: &Path, log: &Path, err: &Path, primers: &Primers, sequencer: Sequencer) -> Self {
            let primer = match end {
                End::Five => primers.five_prime.clone(),
                End::Three => primers.three_prime.clone(),
            };
            SingleParams {
                end,
                input: input.to_path_buf(),
                output: output.to_path_buf(),
                log: log.to_path_buf(),
                err: err.to_path_buf(),
                primer,
                revcomp: sequencer == Sequencer::LongReads,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct PairedParams {
        pub r1: PathBuf,
        pub r2: PathBuf,
        pub out_r1: PathBuf,
        pub out_r2: PathBuf,
        pub log: PathBuf,
        pub err: PathBuf,
        pub five_prime: String,
        pub three_prime: String,
        pub before_denoising: bool,
    }

    pub fn single_arg_generator(p: &SingleParams) -> Vec<String> {
        let flag = match p.end {
            End::Five => "-g",
            End::Three => "-a",
        };
        let mut args = vec![
            flag.to_string(), p.primer.clone(),
            "--error-rate".to_string(), CUTADAPT_ERROR_RATE.to_string(),
            "--discard-untrimmed".to_string(),
            "--match-read-wildcards".to_string(),
            "--overlap".to_string(), p.primer.len().saturating_sub(1).to_string(),
        ];
        if p.revcomp {
            args.push("--revcomp".to_string());
        }
        args.extend(["-o".to_string(), s(&p.output), s(&p.input)]);
        args
    }

    pub fn paired_arg_generator(p: &PairedParams) -> Vec<String> {
        vec![
            "-g".to_string(), format!("{};min_overlap={}", p.five_prime, p.five_prime.len().saturating_sub(1)),
            "-G".to_string(), format!("{};min_overlap={}", revcomp(&p.three_prime), p.three_prime.len().saturating_sub(1)),
            "--minimum-length".to_string(), "1".to_string(),
            "--error-rate".to_string(), CUTADAPT_ERROR_RATE.to_string(),
            "--discard-untrimmed".to_string(),
            "--match-read-wildcards".to_string(),
            "--pair-filter=any".to_string(),
            "-o".to_string(), s(&p.out_r1),
            "-p".to_string(), s(&p.out_r2),
            s(&p.r1),
            s(&p.r2),
        ]
    }

    /// Reads the report cutadapt prints for paired reads.
    ///
    /// # Returns
    /// (pairs with the 5' primer, pairs written), both 0 when absent.
    pub fn parse_paired_report(report: &str) -> (String, String) {
        let mut five = "0".to_string();
        let mut both = "0".to_string();
        for line in report.lines() {
            let trimmed = line.trim();
            let field = || trimmed.split_whitespace().nth(4).map(|v| v.replace(',', ""));
            if trimmed.starts_with("Read 1 with adapter:") {
                if let Some(v) = field() {
                    five = v;
                }
            }
            if trimmed.starts_with("Pairs written (passing filters):") {
                if let Some(v) = field() {
                    both = v;
                }
            }
        }
        (five, both)
    }
}

pub mod filter {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Params {
        pub r1: PathBuf,
        pub r2: Option<PathBuf>,
        pub out_r1: PathBuf,
        pub out_r2: Option<PathBuf>,
        pub min_length: Option<usize>,
        pub max_length: Option<usize>,
        pub max_n: Option<usize>,
        pub tag: Option<String>,
        pub log: PathBuf,
        pub quality_454: bool,
    }

    pub fn arg_generator(p: &Params) -> Vec<String> {
        let mut args = Vec::new();
        if p.r2.is_none() {
            args.push("--force-fasta".to_string());
        }
        if p.quality_454 {
            args.extend(["--max-homopolymer".to_string(), MAX_HOMOPOLYMER_454.to_string()]);
            args.push("--qual-window".to_string());
            args.extend(QUAL_WINDOW_454.split_whitespace().map(str::to_string));
        }
        if let Some(min) = p.min_length {
            args.extend(["--min-length".to_string(), min.to_string()]);
        }
        if let Some(max) = p.max_length {
            args.extend(["--max-length".to_string(), max.to_string()]);
        }
        if let Some(tag) = &p.tag {
            args.extend(["--tag".to_string(), tag.clone()]);
        }
        if let Some(max_n) = p.max_n {
            args.extend(["--max-N".to_string(), max_n.to_string()]);
        }
        args.extend(["--input-file1".to_string(), s(&p.r1)]);
        if let Some(r2) = &p.r2 {
            args.extend(["--input-file2".to_string(), s(r2)]);
        }
        args.extend(["--output-file1".to_string(), s(&p.out_r1)]);
        if let Some(out_r2) = &p.out_r2 {
            args.extend(["--output-file2".to_string(), s(out_r2)]);
        }
        args.extend(["--log-file".to_string(), s(&p.log)]);
        args
    }

    /// Turns the filter's own counters into the funnel written to the sample log.
    ///
    /// # Arguments
    ///
    /// * `report` - Content of the filter log (`Nb seq processed : N`, `Nb seq filtered on length : N`, ...).
    ///
    /// # Returns
    /// `Results:` block, one `nb seq ...` line per applied filter.
    pub fn funnel(report: &str) -> Result<String, PipelineError> {
        let value = |line: &str| -> Result<u64, PipelineError> {
            line.split(':')
                .nth(1)
                .map(str::trim)
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| PipelineError::parse(FILTER_SEQ_TAG, format!("unreadable counter line '{}'", line)))
        };
        let mut processed = 0u64;
        let mut on_tag = None;
        let mut on_length = None;
        let mut on_n = None;
        let mut on_homopolymer = None;
        let mut on_quality = None;
        for line in report.lines() {
            if line.starts_with("Nb seq filtered on length") {
                on_length = Some(value(line)?);
            } else if line.starts_with("Nb seq filtered on absence of tag") {
                on_tag = Some(value(line)?);
            } else if line.starts_with("Nb seq filtered on N") {
                on_n = Some(value(line)?);
            } else if line.starts_with("Nb seq filtered on homopolymer") {
                on_homopolymer = Some(value(line)?);
            } else if line.starts_with("Nb seq filtered on quality") {
                on_quality = Some(value(line)?);
            } else if line.starts_with("Nb seq processed") {
                processed = value(line)?;
            }
        }

        let mut remaining = processed;
        let mut out = String::from("Results:\n");
        let steps = [
            (on_tag, "(nb seq with expected tag", ")"),
            (on_length, "nb seq with expected length", ""),
            (on_n, "nb seq without N", ""),
            (on_homopolymer, "nb seq without large homopolymer", ""),
            (on_quality, "nb seq without nearest poor quality", ""),
        ];
        for (filtered, label, close) in steps {
            if let Some(filtered) = filtered {
                remaining = remaining.saturating_sub(filtered);
                out.push_str(&format!("\t{} : {}{}\n", label, remaining, close));
            }
        }
        Ok(out)
    }
}

pub mod swarm {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Params {
        pub input: PathBuf,
        pub composition: PathBuf,
        pub log: PathBuf,
        pub distance: usize,
        pub fastidious: bool,
        pub threads: usize,
    }

    pub fn arg_generator(p: &Params) -> Vec<String> {
        let mut args = vec!["--differences".to_string(), p.distance.to_string()];
        if p.fastidious {
            args.push("--fastidious".to_string());
        }
        args.extend([
            "--threads".to_string(), p.threads.to_string(),
            "--log".to_string(), s(&p.log),
            "--output-file".to_string(), s(&p.composition),
            s(&p.input),
        ]);
        args
    }
}

pub mod dada2 {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Params {
        pub r1_files: Vec<PathBuf>,
        pub r2_files: Vec<PathBuf>,
        pub output_dir: PathBuf,
        pub threads: usize,
        pub file_names: PathBuf,
        pub stderr: PathBuf,
        pub pseudo_pooling: bool,
        pub debug: bool,
    }

    fn join(paths: &[PathBuf]) -> String {
        paths.iter().map(|p| s(p)).collect::<Vec<_>>().join(",")
    }

    pub fn arg_generator(p: &Params) -> Vec<String> {
        let mut args = vec![
            "--R1Files".to_string(), join(&p.r1_files),
            "--R2Files".to_string(), join(&p.r2_files),
        ];
        if p.pseudo_pooling {
            args.push("--pseudopooling".to_string());
        }
        if p.debug {
            args.push("--debug".to_string());
        }
        args.extend([
            "--outputDir".to_string(), s(&p.output_dir),
            "--fileNames".to_string(), s(&p.file_names),
            "--threads".to_string(), p.threads.to_string(),
        ]);
        args
    }
}

/// One external call. The closed set of programs the pipeline runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Tool {
    Vsearch(vsearch::Params),
    Flash(flash::Params),
    Pear(pear::Params),
    Remove454Primers {
        input: PathBuf,
        output: PathBuf,
        log: PathBuf,
        err: PathBuf,
        primers: Primers,
        min_length: usize,
    },
    Cutadapt(cutadapt::SingleParams),
    CutadaptPaired(cutadapt::PairedParams),
    MultiFilter(filter::Params),
    Combine {
        r1: PathBuf,
        r2: PathBuf,
        join_tag: String,
        output: PathBuf,
    },
    ReplaceJoinTag {
        input: PathBuf,
        split_tag: String,
        join_tag: String,
        output: PathBuf,
    },
    DerepBySample {
        inputs: Vec<PathBuf>,
        output: PathBuf,
        count: PathBuf,
        size_separator: Option<String>,
    },
    DerepGlobal {
        samples_ref: PathBuf,
        output: PathBuf,
        count: PathBuf,
        nb_cpus: usize,
    },
    SortAbundances {
        input: PathBuf,
        output: PathBuf,
        size_separator: String,
        debug: bool,
    },
    Swarm(swarm::Params),
    ExtractSwarmsFasta {
        input: PathBuf,
        composition: PathBuf,
        output: PathBuf,
    },
    Swarm2Biom {
        composition: PathBuf,
        count: PathBuf,
        biom: PathBuf,
    },
    Dada2Core(dada2::Params),
    HClassification {
        biom: PathBuf,
        newick: PathBuf,
        log: PathBuf,
    },
    Depths {
        biom: PathBuf,
        output: PathBuf,
    },
}

impl Tool {
    /// Program name, looked up in the tool directory then in `PATH`.
    pub fn program(&self) -> &'static str {
        match self {
            Tool::Vsearch(_) => VSEARCH_TAG,
            Tool::Flash(_) => FLASH_TAG,
            Tool::Pear(_) => PEAR_TAG,
            Tool::Remove454Primers { .. } => REMOVE454_TAG,
            Tool::Cutadapt(_) | Tool::CutadaptPaired(_) => CUTADAPT_TAG,
            Tool::MultiFilter(_) => FILTER_SEQ_TAG,
            Tool::Combine { .. } | Tool::ReplaceJoinTag { .. } => COMBINE_TAG,
            Tool::DerepBySample { .. } | Tool::DerepGlobal { .. } => DEREP_TAG,
            Tool::SortAbundances { .. } => SORT_ABUNDANCES_TAG,
            Tool::Swarm(_) => SWARM_TAG,
            Tool::ExtractSwarmsFasta { .. } => EXTRACT_SWARMS_TAG,
            Tool::Swarm2Biom { .. } => SWARM2BIOM_TAG,
            Tool::Dada2Core(_) => DADA2_TAG,
            Tool::HClassification { .. } | Tool::Depths { .. } => BIOM_TOOLS_TAG,
        }
    }

    /// One-line description written in the audit log. Summary parsing keys
    /// on some of these texts.
    pub fn description(&self) -> &'static str {
        match self {
            Tool::Vsearch(_) | Tool::Pear(_) => "join overlapping paired reads",
            Tool::Flash(_) => "Join overlapping paired reads.",
            Tool::Remove454Primers { .. } => "Removes reads without the 3' and 5' primer and removes primers sequences.",
            Tool::Cutadapt(p) => match p.end {
                cutadapt::End::Five => "Removes reads without the 5' primer and removes primer sequence.",
                cutadapt::End::Three => "Removes reads without the 3' primer and removes primer sequence.",
            },
            Tool::CutadaptPaired(p) if p.before_denoising => {
                "Before all, removes read pairs without the 5' and 3' primer and removes primer sequence."
            }
            Tool::CutadaptPaired(_) => "Removes read pairs without the 5' and 3' primer and removes primer sequence.",
            Tool::MultiFilter(p) if p.quality_454 => {
                "Filters amplicons without primers by length, N count, homopolymer length and distance between quality low quality."
            }
            Tool::MultiFilter(_) => "Filters amplicons without primers by length and N count.",
            Tool::Combine { .. } => "Concatenate paired reads.",
            Tool::ReplaceJoinTag { .. } => "Replace join tag.",
            Tool::DerepBySample { .. } => "Dereplicates sample sequences.",
            Tool::DerepGlobal { .. } => "Dereplicates together sequences from several samples.",
            Tool::SortAbundances { .. } => "Sort pre-clusters by abundancies.",
            Tool::Swarm(_) => "Clustering sequences.",
            Tool::ExtractSwarmsFasta { .. } => "Extracts seeds sequences to produce the seeds fasta.",
            Tool::Swarm2Biom { .. } => "Converts swarm output to abundance file (format BIOM).",
            Tool::Dada2Core(_) => "Write denoised FASTQ files from cutadapted and cleaned FASTQ files",
            Tool::HClassification { .. } => "Hierarchical classification on observation proportions.",
            Tool::Depths { .. } => "Writes by abundance the number of clusters.",
        }
    }

    /// Merged reads written by a merge tool.
    pub fn assembled(&self) -> Option<PathBuf> {
        match self {
            Tool::Vsearch(p) => Some(p.assembled()),
            Tool::Flash(p) => Some(p.assembled()),
            Tool::Pear(p) => Some(p.assembled()),
            _ => None,
        }
    }

    pub fn version_flag(&self) -> &'static str {
        "--version"
    }

    pub fn version_source(&self) -> VersionSource {
        match self {
            Tool::Pear(_) | Tool::Flash(_) => VersionSource::StdoutSecondToken,
            Tool::Vsearch(_) => VersionSource::StderrBeforeComma,
            Tool::Swarm(_) => VersionSource::StderrSecondToken,
            Tool::Cutadapt(_) | Tool::CutadaptPaired(_) | Tool::Dada2Core(_) => VersionSource::StdoutRaw,
            _ => VersionSource::StdoutTrimmed,
        }
    }

    pub fn build_argv(&self) -> Vec<String> {
        match self {
            Tool::Vsearch(p) => vsearch::arg_generator(p),
            Tool::Flash(p) => flash::arg_generator(p),
            Tool::Pear(p) => pear::arg_generator(p),
            Tool::Remove454Primers { input, output, primers, min_length, .. } => vec![
                "--five-prim-primer".to_string(), primers.five_prime.clone(),
                "--three-prim-primer".to_string(), primers.three_prime.clone(),
                "--error-rate".to_string(), CUTADAPT_ERROR_RATE.to_string(),
                "--non-overlap".to_string(), "1".to_string(),
                "--min-length".to_string(), min_length.to_string(),
                "-i".to_string(), s(input),
                "-o".to_string(), s(output),
            ],
            Tool::Cutadapt(p) => cutadapt::single_arg_generator(p),
            Tool::CutadaptPaired(p) => cutadapt::paired_arg_generator(p),
            Tool::MultiFilter(p) => filter::arg_generator(p),
            Tool::Combine { r1, r2, join_tag, output } => vec![
                "--reads1".to_string(), s(r1),
                "--reads2".to_string(), s(r2),
                "-c".to_string(), join_tag.clone(),
                "--combined-output".to_string(), s(output),
            ],
            Tool::ReplaceJoinTag { input, split_tag, join_tag, output } => vec![
                "--reads1".to_string(), s(input),
                "-s".to_string(), split_tag.clone(),
                "-c".to_string(), join_tag.clone(),
                "--combined-output".to_string(), s(output),
            ],
            Tool::DerepBySample { inputs, output, count, size_separator } => {
                let mut args = vec!["--sequences-files".to_string()];
                args.extend(inputs.iter().map(|p| s(p)));
                args.extend([
                    "--dereplicated-file".to_string(), s(output),
                    "--count-file".to_string(), s(count),
                ]);
                if let Some(sep) = size_separator {
                    args.extend(["--size-separator".to_string(), sep.clone()]);
                }
                args
            }
            Tool::DerepGlobal { samples_ref, output, count, nb_cpus } => vec![
                "--nb-cpus".to_string(), nb_cpus.to_string(),
                "--size-separator".to_string(), SIZE_SEPARATOR.to_string(),
                "--samples-ref".to_string(), s(samples_ref),
                "--dereplicated-file".to_string(), s(output),
                "--count-file".to_string(), s(count),
            ],
            Tool::SortAbundances { input, output, size_separator, debug } => {
                let mut args = vec![
                    "--size-separator".to_string(), size_separator.clone(),
                    "--input-file".to_string(), s(input),
                    "--output-file".to_string(), s(output),
                ];
                if *debug {
                    args.push("--debug".to_string());
                }
                args
            }
            Tool::Swarm(p) => swarm::arg_generator(p),
            Tool::ExtractSwarmsFasta { input, composition, output } => vec![
                "--input-fasta".to_string(), s(input),
                "--input-swarms".to_string(), s(composition),
                "--output-fasta".to_string(), s(output),
            ],
            Tool::Swarm2Biom { composition, count, biom } => vec![
                "--clusters-file".to_string(), s(composition),
                "--count-file".to_string(), s(count),
                "--output-file".to_string(), s(biom),
            ],
            Tool::Dada2Core(p) => dada2::arg_generator(p),
            Tool::HClassification { biom, newick, .. } => vec![
                "hclassification".to_string(),
                "--distance-method".to_string(), HCLASSIF_DISTANCE.to_string(),
                "--linkage-method".to_string(), HCLASSIF_LINKAGE.to_string(),
                "--input-file".to_string(), s(biom),
                "--output-file".to_string(), s(newick),
            ],
            Tool::Depths { biom, output } => vec![
                "obsdepth".to_string(),
                "--input-file".to_string(), s(biom),
                "--output-file".to_string(), s(output),
            ],
        }
    }

    pub fn redirects(&self) -> Redirects {
        match self {
            Tool::Pear(p) => Redirects { stdout: Some(p.log.clone()), stderr: None },
            Tool::Flash(p) => Redirects { stdout: None, stderr: Some(p.stderr.clone()) },
            Tool::Vsearch(p) => Redirects { stdout: None, stderr: Some(p.log.clone()) },
            Tool::Remove454Primers { log, err, .. } => Redirects { stdout: Some(log.clone()), stderr: Some(err.clone()) },
            Tool::Cutadapt(p) => Redirects { stdout: Some(p.log.clone()), stderr: Some(p.err.clone()) },
            Tool::CutadaptPaired(p) => Redirects { stdout: Some(p.log.clone()), stderr: Some(p.err.clone()) },
            Tool::Dada2Core(p) => Redirects { stdout: None, stderr: Some(p.stderr.clone()) },
            Tool::HClassification { log, .. } => Redirects { stdout: Some(log.clone()), stderr: None },
            _ => Redirects::default(),
        }
    }

    /// Parser hook run after a successful call. Appends derived statistics
    /// to the sample log.
    pub fn on_success(&self, log: &Path) -> Result<(), PipelineError> {
        match self {
            Tool::Vsearch(_) | Tool::Flash(_) | Tool::Pear(_) => {
                let assembled = self.assembled().unwrap_or_default();
                let merged = count_sequences(&assembled)
                    .map_err(|e| PipelineError::parse(self.program(), format!("{}: {}", assembled.display(), e)))?;
                append_to_log(log, &format!("Results:\n\tnb seq paired-end assembled: {}\n", merged))?;
            }
            Tool::Remove454Primers { output, .. } => {
                let kept = count_sequences(output).map_err(|e| PipelineError::parse(REMOVE454_TAG, e.to_string()))?;
                append_to_log(log, &format!("Results:\n\tnb seq with the two primers : {}\n", kept))?;
            }
            Tool::Cutadapt(p) => {
                let kept = count_sequences(&p.output).map_err(|e| PipelineError::parse(CUTADAPT_TAG, e.to_string()))?;
                let label = match p.end {
                    cutadapt::End::Five => "nb seq with 5' primer",
                    cutadapt::End::Three => "nb seq with 3' primer",
                };
                append_to_log(log, &format!("Results:\n\t{} : {}\n", label, kept))?;
            }
            Tool::CutadaptPaired(p) => {
                let report = std::fs::read_to_string(&p.log)?;
                let (five, both) = cutadapt::parse_paired_report(&report);
                append_to_log(
                    log,
                    &format!("Results:\n\tnb seq with 5' primer : {}\n\tnb seq with 3' primer : {}\n", five, both),
                )?;
            }
            Tool::MultiFilter(p) => {
                let report = std::fs::read_to_string(&p.log)?;
                append_to_log(log, &filter::funnel(&report)?)?;
            }
            Tool::HClassification { log: exec_log, .. } => {
                let content = std::fs::read_to_string(exec_log)?;
                let warnings: Vec<&str> = content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .collect();
                if content.contains("xcluded samples") {
                    let mut text = String::from("Warning:\n");
                    for line in warnings {
                        text.push_str(&format!("\t{}\n", line));
                    }
                    append_to_log(log, &text)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Builds the merge call selected by the configuration.
///
/// # Arguments
///
/// * `config` - Run configuration; must carry merge settings.
/// * `r1`, `r2` - Reads to merge.
/// * `out_prefix` - Output prefix, suffixes are added by the tool.
/// * `log` - File receiving the tool's report stream.
pub fn merge_tool(config: &RunConfiguration, r1: &Path, r2: &Path, out_prefix: &Path, log: &Path) -> Result<Tool, PipelineError> {
    let merge = config
        .merge
        .as_ref()
        .ok_or_else(|| PipelineError::config("read merging requested on contiged reads"))?;
    let (min, max) = (config.min_amplicon_size, config.max_amplicon_size);
    let tool = match merge.software {
        crate::cli::MergeSoftware::Vsearch => Tool::Vsearch(vsearch::Params::new(r1, r2, out_prefix, log, merge, max)),
        crate::cli::MergeSoftware::Pear => Tool::Pear(pear::Params::new(r1, r2, out_prefix, log, merge, min, max)),
        crate::cli::MergeSoftware::Flash => {
            let expected = merge
                .expected_amplicon_size
                .ok_or_else(|| PipelineError::config("flash needs --expected-amplicon-size"))?;
            Tool::Flash(flash::Params::new(r1, r2, out_prefix, log, merge, min, max, expected))
        }
    };
    Ok(tool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{MergeSoftware, QualityScale};

    fn merge(software: MergeSoftware) -> MergeSettings {
        MergeSettings {
            software,
            r1_size: 150,
            r2_size: 150,
            expected_amplicon_size: Some(250),
            mismatch_rate: 0.1,
            quality_scale: QualityScale::Phred33,
        }
    }

    fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(String::as_str)
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(VersionSource::StdoutSecondToken.parse(" ____\nPEAR v0.9.11 [Nov 5, 2017]", ""), Some("v0.9.11".to_string()));
        assert_eq!(
            VersionSource::StderrBeforeComma.parse("", "vsearch v2.21.1_linux_x86_64, 15.5GB RAM, 8 cores"),
            Some("v2.21.1_linux_x86_64".to_string())
        );
        assert_eq!(VersionSource::StderrSecondToken.parse("", "Swarm 3.1.0\nCopyright"), Some("3.1.0".to_string()));
        assert_eq!(VersionSource::StdoutTrimmed.parse("5.0.0\n", ""), Some("5.0.0".to_string()));
        assert_eq!(VersionSource::StdoutSecondToken.parse("", ""), None);
    }

    #[test]
    fn test_vsearch_args() {
        let p = vsearch::Params::new(
            Path::new("/d/S1_R1.fastq.gz"),
            Path::new("/d/S1_R2.fastq.gz"),
            Path::new("/w/S1_vsearch"),
            Path::new("/w/S1_vsearch.log"),
            &merge(MergeSoftware::Vsearch),
            250,
        );
        let tool = Tool::Vsearch(p);
        let args = tool.build_argv();
        assert_eq!(arg_value(&args, "--fastq_minovlen"), Some("50"));
        assert_eq!(arg_value(&args, "--fastq_maxdiffpct"), Some("10"));
        assert_eq!(arg_value(&args, "--fastq_ascii"), Some("33"));
        assert_eq!(arg_value(&args, "--fastqout"), Some("/w/S1_vsearch.assembled.fastq"));
        assert_eq!(arg_value(&args, "--fastqout_notmerged_rev"), Some("/w/S1_vsearch.unassembled_R2.fastq"));
        assert_eq!(tool.redirects().stderr, Some(PathBuf::from("/w/S1_vsearch.log")));
        assert_eq!(tool.version_source(), VersionSource::StderrBeforeComma);
    }

    #[test]
    fn test_flash_args() {
        let p = flash::Params::new(
            Path::new("r1.fq"),
            Path::new("r2.fq"),
            Path::new("/w/S1_flash"),
            Path::new("/w/S1_flash.stderr"),
            &merge(MergeSoftware::Flash),
            200,
            250,
            250,
        );
        let args = flash::arg_generator(&p);
        assert_eq!(arg_value(&args, "--min-overlap"), Some("50"));
        assert_eq!(arg_value(&args, "--max-overlap"), Some("70"));
        assert_eq!(arg_value(&args, "--output-directory"), Some("/w"));
        assert_eq!(arg_value(&args, "--output-prefix"), Some("S1_flash"));
        assert_eq!(p.assembled(), PathBuf::from("/w/S1_flash.extendedFrags.fastq.gz"));
    }

    #[test]
    fn test_pear_args() {
        let p = pear::Params::new(
            Path::new("r1.fq"),
            Path::new("r2.fq"),
            Path::new("S1_pear"),
            Path::new("S1_pear.log"),
            &merge(MergeSoftware::Pear),
            100,
            400,
        );
        let args = pear::arg_generator(&p);
        assert_eq!(arg_value(&args, "--max-assembly-length"), Some("290"));
        assert_eq!(arg_value(&args, "--min-assembly-length"), Some("100"));
        assert_eq!(arg_value(&args, "--min-overlap"), Some("10"));
        assert_eq!(args.last().map(String::as_str), Some("--keep-original"));
    }

    #[test]
    fn test_cutadapt_args() {
        let primers = Primers { five_prime: "ACGGT".to_string(), three_prime: "TTRCA".to_string() };
        let p = cutadapt::SingleParams::new(
            cutadapt::End::Five,
            Path::new("in.fq"),
            Path::new("out.fq"),
            Path::new("log"),
            Path::new("err"),
            &primers,
            Sequencer::LongReads,
        );
        let args = cutadapt::single_arg_generator(&p);
        assert_eq!(&args[..2], &["-g".to_string(), "ACGGT".to_string()]);
        assert_eq!(arg_value(&args, "--overlap"), Some("4"));
        assert!(args.contains(&"--revcomp".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("in.fq"));

        let paired = cutadapt::PairedParams {
            r1: PathBuf::from("r1"),
            r2: PathBuf::from("r2"),
            out_r1: PathBuf::from("o1"),
            out_r2: PathBuf::from("o2"),
            log: PathBuf::from("log"),
            err: PathBuf::from("err"),
            five_prime: primers.five_prime.clone(),
            three_prime: primers.three_prime.clone(),
            before_denoising: false,
        };
        let args = cutadapt::paired_arg_generator(&paired);
        assert_eq!(arg_value(&args, "-g"), Some("ACGGT;min_overlap=4"));
        assert_eq!(arg_value(&args, "-G"), Some("TGYAA;min_overlap=4"));
        assert!(args.contains(&"--pair-filter=any".to_string()));
        assert!(Tool::CutadaptPaired(paired).description().starts_with("Removes read pairs"));
    }

    #[test]
    fn test_paired_report() {
        let report = "=== Summary ===\n\nTotal read pairs processed:          1,000\n  Read 1 with adapter:                  950 (95.0%)\n  Read 2 with adapter:                  940 (94.0%)\nPairs written (passing filters):        1,900 (90.0%)\n";
        let (five, both) = cutadapt::parse_paired_report(report);
        assert_eq!(five, "950");
        assert_eq!(both, "1900");
    }

    #[test]
    fn test_filter_args_and_funnel() -> Result<(), PipelineError> {
        let p = filter::Params {
            r1: PathBuf::from("in.fq"),
            r2: None,
            out_r1: PathBuf::from("out.fasta"),
            out_r2: None,
            min_length: Some(380),
            max_length: Some(460),
            max_n: Some(0),
            tag: None,
            log: PathBuf::from("filter.log"),
            quality_454: true,
        };
        let args = filter::arg_generator(&p);
        assert_eq!(args[0], "--force-fasta");
        assert_eq!(arg_value(&args, "--max-homopolymer"), Some("7"));
        assert_eq!(arg_value(&args, "--qual-window"), Some("threshold:10"));
        assert!(args.contains(&"win_size:10".to_string()));
        assert_eq!(arg_value(&args, "--max-N"), Some("0"));

        let report = "Nb seq processed : 1000\nNb seq filtered on length : 100\nNb seq filtered on N : 50\nNb seq filtered on homopolymer : 10\n";
        let funnel = filter::funnel(report)?;
        assert_eq!(
            funnel,
            "Results:\n\tnb seq with expected length : 900\n\tnb seq without N : 850\n\tnb seq without large homopolymer : 840\n"
        );
        assert!(filter::funnel("Nb seq processed : lots\n").is_err());
        Ok(())
    }

    #[test]
    fn test_derep_args() {
        let tool = Tool::DerepBySample {
            inputs: vec![PathBuf::from("a.fasta"), PathBuf::from("b.fasta")],
            output: PathBuf::from("derep.fasta"),
            count: PathBuf::from("count.tsv"),
            size_separator: Some(SIZE_SEPARATOR.to_string()),
        };
        let args = tool.build_argv();
        assert_eq!(&args[..3], &["--sequences-files".to_string(), "a.fasta".to_string(), "b.fasta".to_string()]);
        assert_eq!(arg_value(&args, "--size-separator"), Some(";size="));
        assert_eq!(tool.program(), DEREP_TAG);
    }

    #[test]
    fn test_swarm_args() {
        let tool = Tool::Swarm(swarm::Params {
            input: PathBuf::from("sorted.fasta"),
            composition: PathBuf::from("compo.txt"),
            log: PathBuf::from("swarm.log"),
            distance: 1,
            fastidious: true,
            threads: 4,
        });
        assert_eq!(
            tool.build_argv(),
            vec!["--differences", "1", "--fastidious", "--threads", "4", "--log", "swarm.log", "--output-file", "compo.txt", "sorted.fasta"]
        );
        assert_eq!(tool.version_source(), VersionSource::StderrSecondToken);
    }

    #[test]
    fn test_revcomp() {
        assert_eq!(revcomp("ACGTRYN"), "NRYACGT");
        assert_eq!(revcomp("acgt"), "acgt");
    }
}
