use thiserror::Error;

// External software
pub const VSEARCH_TAG: &str = "vsearch";
pub const FLASH_TAG: &str = "flash";
pub const PEAR_TAG: &str = "pear";
pub const CUTADAPT_TAG: &str = "cutadapt";
pub const REMOVE454_TAG: &str = "remove454Adapt.py";
pub const FILTER_SEQ_TAG: &str = "filterSeq.py";
pub const COMBINE_TAG: &str = "combine_and_split.py";
pub const DEREP_TAG: &str = "derepSamples.py";
pub const SORT_ABUNDANCES_TAG: &str = "sortAbundancies.py";
pub const SWARM_TAG: &str = "swarm";
pub const EXTRACT_SWARMS_TAG: &str = "extractSwarmsFasta.py";
pub const SWARM2BIOM_TAG: &str = "swarm2biom.py";
pub const DADA2_TAG: &str = "dada2_process.R";
pub const BIOM_TOOLS_TAG: &str = "biomTools.py";

// Static Parameters
pub const MIN_OVERLAP_FLOOR: i64 = 10;
pub const MAX_OVERLAP_SLACK: i64 = 20;
pub const PEAR_ASSEMBLY_MARGIN: usize = 10;
pub const CUTADAPT_ERROR_RATE: f64 = 0.1;
pub const MAX_HOMOPOLYMER_454: usize = 7;
pub const QUAL_WINDOW_454: &str = "threshold:10 win_size:10";
pub const DENOISING_MIN_LENGTH: usize = 20;
pub const SPACER_LENGTH: usize = 100;
pub const JOIN_TAG_CHAR: char = 'X';
pub const SPACER_CHAR: char = 'N';
pub const SIZE_SEPARATOR: &str = ";size=";
pub const COMBINED_TAG: &str = "FROGS_combined";
pub const STDERR_TAIL_LINES: usize = 20;
pub const UNKNOWN_VERSION: &str = "unknown";
pub const HCLASSIF_DISTANCE: &str = "braycurtis";
pub const HCLASSIF_LINKAGE: &str = "average";

pub const FASTA_TAG: &str = "fasta";
pub const FASTQ_TAG: &str = "fastq";

/// Broad failure category, used by callers that only care about where a
/// run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Execution,
    DataIntegrity,
    Io,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{program} exited with {status}\nCommand: {command_line}\n{stderr_tail}")]
    CommandFailed {
        program: String,
        command_line: String,
        status: String,
        stderr_tail: String,
    },

    #[error("Failed to spawn {program}: {error}")]
    Spawn { program: String, error: String },

    #[error("Could not interpret output of {program}: {reason}")]
    OutputParse { program: String, reason: String },

    #[error("Error in worker execution: {}", .0.join("; "))]
    WorkersFailed(Vec<String>),

    #[error("Data integrity: {0}")]
    DataIntegrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidConfig(_) => ErrorKind::Configuration,
            PipelineError::CommandFailed { .. }
            | PipelineError::Spawn { .. }
            | PipelineError::OutputParse { .. }
            | PipelineError::WorkersFailed(_) => ErrorKind::Execution,
            PipelineError::DataIntegrity(_) => ErrorKind::DataIntegrity,
            PipelineError::Io(_) | PipelineError::Json(_) | PipelineError::Other(_) => ErrorKind::Io,
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        PipelineError::InvalidConfig(msg.into())
    }

    pub fn parse<S: Into<String>>(program: &str, reason: S) -> Self {
        PipelineError::OutputParse {
            program: program.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(PipelineError::config("x").kind(), ErrorKind::Configuration);
        assert_eq!(PipelineError::WorkersFailed(vec!["bucket 1".into()]).kind(), ErrorKind::Execution);
        assert_eq!(PipelineError::parse("swarm", "bad").kind(), ErrorKind::Execution);
        assert_eq!(PipelineError::DataIntegrity("empty".into()).kind(), ErrorKind::DataIntegrity);
    }

    #[test]
    fn test_command_failed_message() {
        let err = PipelineError::CommandFailed {
            program: "cutadapt".to_string(),
            command_line: "cutadapt -g ACGT in.fq".to_string(),
            status: "exit status: 2".to_string(),
            stderr_tail: "No such file".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("cutadapt exited with exit status: 2"));
        assert!(msg.contains("cutadapt -g ACGT in.fq"));
        assert!(msg.contains("No such file"));
    }

    #[test]
    fn test_workers_failed_names_buckets() {
        let err = PipelineError::WorkersFailed(vec!["bucket 1 (S2, S4)".into(), "bucket 2 (S3)".into()]);
        let msg = format!("{err}");
        assert!(msg.contains("bucket 1 (S2, S4)"));
        assert!(msg.contains("bucket 2 (S3)"));
    }
}
