/// Running one external tool call and recording it in the audit log

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use chrono::Local;
use log::{debug, warn};
use tokio::process::Command;

use crate::config::defs::{PipelineError, STDERR_TAIL_LINES, UNKNOWN_VERSION};
use crate::config::run::RunConfiguration;
use crate::utils::file::{append_to_log, tail_lines};
use crate::utils::tools::{Tool, VersionSource};

const AUDIT_RULE: &str = "########################################################################";

/// A resolved call: program path plus argument vector, built once and
/// submitted once.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    tool: Tool,
    program: PathBuf,
    argv: Vec<String>,
}

impl CommandInvocation {
    pub fn new(tool: Tool, config: &RunConfiguration) -> Self {
        let program = config.resolve_program(tool.program());
        let argv = tool.build_argv();
        CommandInvocation { tool, program, argv }
    }

    /// Same as `new` with an explicit program path.
    pub fn with_program(tool: Tool, program: PathBuf) -> Self {
        let argv = tool.build_argv();
        CommandInvocation { tool, program, argv }
    }

    /// Program followed by its arguments, space separated.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.argv.iter().cloned());
        parts.join(" ")
    }

    /// Runs the call to completion.
    ///
    /// # Arguments
    ///
    /// * `log` - Audit log of the calling scope. Receives the command record
    ///   and whatever the tool's parser hook appends.
    ///
    /// # Returns
    /// Ok once the program exited 0, its record was written and its hook ran.
    pub async fn submit(self, log: &Path) -> Result<(), PipelineError> {
        let program_name = self.tool.program().to_string();
        debug!("Running: {}", self.command_line());

        let start = Local::now();
        let output = Command::new(&self.program)
            .args(&self.argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PipelineError::Spawn { program: program_name.clone(), error: e.to_string() })?;
        let end = Local::now();

        let redirects = self.tool.redirects();
        if let Some(path) = &redirects.stdout {
            fs::write(path, &output.stdout)?;
        }
        if let Some(path) = &redirects.stderr {
            fs::write(path, &output.stderr)?;
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::CommandFailed {
                program: program_name,
                command_line: self.command_line(),
                status: output.status.to_string(),
                stderr_tail: tail_lines(&stderr, STDERR_TAIL_LINES),
            });
        }

        let version = self.query_version().await;
        let record = format!(
            "{rule}\n# {description} ({program} version : {version})\nCommand:\n\t{command}\n\nExecution:\n\tstart: {start}\n\tend:   {end}\n\n",
            rule = AUDIT_RULE,
            description = self.tool.description(),
            program = program_name,
            version = version.trim_end(),
            command = self.command_line(),
            start = start.format("%d %b %Y %H:%M:%S"),
            end = end.format("%d %b %Y %H:%M:%S"),
        );
        append_to_log(log, &record)?;

        self.tool.on_success(log)
    }

    /// Asks the program for its version. Never fails: an unreadable answer
    /// is recorded as unknown.
    async fn query_version(&self) -> String {
        let result = Command::new(&self.program)
            .arg(self.tool.version_flag())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        match result {
            Ok(output) => parse_version(self.tool.version_source(), &output).unwrap_or_else(|| {
                warn!("Could not read the version of {}", self.tool.program());
                UNKNOWN_VERSION.to_string()
            }),
            Err(e) => {
                warn!("Version query of {} failed: {}", self.tool.program(), e);
                UNKNOWN_VERSION.to_string()
            }
        }
    }
}

/// Extracts a version from the captured output of a version query.
pub fn parse_version(source: VersionSource, output: &Output) -> Option<String> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    source.parse(&stdout, &stderr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::ErrorKind;

    fn derep_tool(dir: &Path) -> Tool {
        Tool::DerepBySample {
            inputs: vec![dir.join("in.fasta")],
            output: dir.join("out.fasta"),
            count: dir.join("count.tsv"),
            size_separator: None,
        }
    }

    #[test]
    fn test_command_line() {
        let dir = Path::new("/w");
        let invocation = CommandInvocation::with_program(derep_tool(dir), PathBuf::from("/opt/derepSamples.py"));
        assert_eq!(
            invocation.command_line(),
            "/opt/derepSamples.py --sequences-files /w/in.fasta --dereplicated-file /w/out.fasta --count-file /w/count.tsv"
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let invocation = CommandInvocation::with_program(derep_tool(dir.path()), dir.path().join("does_not_exist"));
        let err = invocation.submit(&dir.path().join("log.txt")).await.err();
        assert!(matches!(err, Some(PipelineError::Spawn { .. })));
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Execution));
        Ok(())
    }
}
