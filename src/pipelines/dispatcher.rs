/// Spreading sample jobs over a CPU budget
///
/// Jobs are split round-robin into at most `nb_cpus` buckets. Bucket 0 runs
/// on the master's own runtime; every other bucket runs in a child process
/// (`<exe> worker --manifest <json>`) so a crashing tool call cannot take
/// down its siblings. All buckets start before any is awaited.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info, LevelFilter};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::defs::{PipelineError, STDERR_TAIL_LINES};
use crate::config::run::RunConfiguration;
use crate::pipelines::sample::{PipelineResult, SampleJob, SamplePipeline};
use crate::utils::file::{append_files_to_log, tail_lines};
use crate::utils::tempfiles::TempFileRegistry;

/// Where a bucket runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    InProcess,
    SpawnedProcess,
}

impl Isolation {
    pub fn for_bucket(index: usize) -> Isolation {
        if index == 0 {
            Isolation::InProcess
        } else {
            Isolation::SpawnedProcess
        }
    }
}

/// Everything a worker process needs: the run options and its jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerManifest {
    pub config: RunConfiguration,
    pub jobs: Vec<SampleJob>,
}

impl WorkerManifest {
    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        serde_json::to_writer(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<WorkerManifest, PipelineError> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }
}

/// Round-robin split of `items` into `min(len, cpu_budget)` non-empty buckets.
/// Item `i` lands in bucket `i % n`.
pub fn partition<T: Clone>(items: &[T], cpu_budget: usize) -> Vec<Vec<T>> {
    let nb_buckets = items.len().min(cpu_budget.max(1));
    let mut buckets: Vec<Vec<T>> = vec![Vec::new(); nb_buckets];
    for (idx, item) in items.iter().enumerate() {
        buckets[idx % nb_buckets].push(item.clone());
    }
    buckets
}

enum Running {
    Local(JoinHandle<Result<(), PipelineError>>),
    Child(tokio::process::Child),
}

pub struct WorkerPool {
    config: Arc<RunConfiguration>,
    worker_program: Option<PathBuf>,
    manifest_dir: PathBuf,
}

impl WorkerPool {
    /// # Arguments
    ///
    /// * `config` - Shared run options.
    /// * `manifest_dir` - Directory receiving the worker manifests.
    pub fn new(config: Arc<RunConfiguration>, manifest_dir: &Path) -> Self {
        WorkerPool { config, worker_program: None, manifest_dir: manifest_dir.to_path_buf() }
    }

    /// Executable started for spawned buckets. Defaults to the running binary.
    pub fn with_worker_program(mut self, program: PathBuf) -> Self {
        self.worker_program = Some(program);
        self
    }

    fn worker_program(&self) -> Result<PathBuf, PipelineError> {
        match &self.worker_program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    /// Runs all jobs and waits for every bucket, failed or not.
    ///
    /// # Arguments
    ///
    /// * `jobs` - Jobs in sample order.
    /// * `master_log` - Run log. Sample logs are appended to it in job order
    ///   once every bucket succeeded.
    ///
    /// # Returns
    /// One result per job, in job order, or `WorkersFailed` naming each
    /// failed bucket and its samples.
    pub async fn dispatch(&self, jobs: Vec<SampleJob>, master_log: &Path) -> Result<Vec<PipelineResult>, PipelineError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let buckets = partition(&jobs, self.config.nb_cpus);
        info!("Dispatching {} samples over {} workers", jobs.len(), buckets.len());

        let mut manifests = TempFileRegistry::new(&self.manifest_dir, "workers_", self.config.debug)?;
        let mut running = Vec::with_capacity(buckets.len());
        for (idx, bucket) in buckets.iter().enumerate() {
            let launched = match Isolation::for_bucket(idx) {
                Isolation::InProcess => {
                    Ok(Running::Local(tokio::spawn(run_bucket(self.config.clone(), bucket.clone()))))
                }
                Isolation::SpawnedProcess => self.launch_worker(&mut manifests, idx, bucket),
            };
            // A bucket that could not start is reported after the others finish.
            running.push(launched);
        }

        let outcomes = join_all(running.into_iter().enumerate().map(|(idx, launched)| wait_bucket(idx, launched))).await;
        let cleanup = manifests.delete_all();

        let failures: Vec<String> = outcomes
            .into_iter()
            .zip(&buckets)
            .enumerate()
            .filter_map(|(idx, (outcome, bucket))| {
                outcome.err().map(|e| {
                    let names: Vec<&str> = bucket.iter().map(|j| j.sample.name.as_str()).collect();
                    format!("bucket {} ({:?}) [{}]: {}", idx, Isolation::for_bucket(idx), names.join(", "), e)
                })
            })
            .collect();
        if !failures.is_empty() {
            for failure in &failures {
                error!("{}", failure);
            }
            return Err(PipelineError::WorkersFailed(failures));
        }
        cleanup?;

        let logs: Vec<PathBuf> = jobs.iter().map(|j| j.log.clone()).collect();
        append_files_to_log(master_log, &logs)?;
        jobs.iter().map(PipelineResult::from_job).collect()
    }

    fn launch_worker(
        &self,
        manifests: &mut TempFileRegistry,
        idx: usize,
        bucket: &[SampleJob],
    ) -> Result<Running, PipelineError> {
        let manifest = manifests.add(&format!("bucket_{}.json", idx))?;
        WorkerManifest { config: (*self.config).clone(), jobs: bucket.to_vec() }.write(&manifest.path)?;
        self.spawn_worker(&manifest.path).map(Running::Child)
    }

    fn spawn_worker(&self, manifest: &Path) -> Result<tokio::process::Child, PipelineError> {
        let program = self.worker_program()?;
        let mut cmd = Command::new(&program);
        if log::max_level() >= LevelFilter::Debug {
            cmd.arg("--verbose");
        }
        cmd.arg("worker").arg("--manifest").arg(manifest);
        debug!("Starting worker {} for {}", program.display(), manifest.display());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Spawn { program: program.display().to_string(), error: e.to_string() })
    }
}

async fn wait_bucket(idx: usize, launched: Result<Running, PipelineError>) -> Result<(), PipelineError> {
    match launched? {
        Running::Local(handle) => handle.await.map_err(|e| PipelineError::Other(e.into()))?,
        Running::Child(child) => {
            let output = child.wait_with_output().await?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if output.status.success() {
                // The worker logs at the parent's level already.
                for line in worker_log_lines(&stderr) {
                    info!("[bucket {}] {}", idx, line);
                }
                Ok(())
            } else {
                Err(PipelineError::CommandFailed {
                    program: "worker".to_string(),
                    command_line: String::new(),
                    status: output.status.to_string(),
                    stderr_tail: tail_lines(&stderr, STDERR_TAIL_LINES),
                })
            }
        }
    }
}

/// Non-blank lines a finished worker wrote on stderr.
fn worker_log_lines(stderr: &str) -> Vec<&str> {
    stderr.lines().map(str::trim_end).filter(|l| !l.is_empty()).collect()
}

/// Runs the jobs of one bucket in order and stops at the first failure.
pub async fn run_bucket(config: Arc<RunConfiguration>, jobs: Vec<SampleJob>) -> Result<(), PipelineError> {
    for job in &jobs {
        SamplePipeline::new(&config, job)?.run().await?;
    }
    Ok(())
}

/// Entry point of the `worker` subcommand.
pub async fn run_worker(manifest: &Path) -> Result<(), PipelineError> {
    let manifest = WorkerManifest::read(manifest)?;
    debug!("Worker started with {} jobs", manifest.jobs.len());
    run_bucket(Arc::new(manifest.config), manifest.jobs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::sample::{Sample, SampleTask};

    fn job(dir: &Path, name: &str) -> SampleJob {
        SampleJob {
            sample: Sample { name: name.to_string(), read1: dir.join(format!("{name}.fasta")), read2: None },
            task: SampleTask::Preprocess,
            filtered: dir.join(format!("{name}_filtered.fasta")),
            filtered_r2: None,
            artificial: dir.join(format!("{name}_artComb_filtered.fasta")),
            count: dir.join(format!("{name}_derep_count.tsv")),
            lengths: dir.join(format!("{name}_lengths.json")),
            log: dir.join(format!("{name}_log.txt")),
            work_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_partition_round_robin() {
        let items: Vec<usize> = (0..7).collect();
        let buckets = partition(&items, 3);
        assert_eq!(buckets, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]);
        assert_eq!(partition(&items[..2], 8).len(), 2);
        assert_eq!(partition(&items, 1), vec![items.clone()]);
        assert!(partition::<usize>(&[], 4).is_empty());
    }

    #[test]
    fn test_partition_sizes() {
        for nb in 1..40usize {
            for cpus in 1..10usize {
                let items: Vec<usize> = (0..nb).collect();
                let buckets = partition(&items, cpus);
                assert_eq!(buckets.len(), nb.min(cpus));
                assert!(buckets.iter().all(|b| !b.is_empty()));
                let sizes: Vec<usize> = buckets.iter().map(Vec::len).collect();
                let max = sizes.iter().max().copied().unwrap_or(0);
                let min = sizes.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1);
                assert_eq!(sizes.iter().sum::<usize>(), nb);
            }
        }
    }

    #[test]
    fn test_isolation() {
        assert_eq!(Isolation::for_bucket(0), Isolation::InProcess);
        assert_eq!(Isolation::for_bucket(3), Isolation::SpawnedProcess);
    }

    #[test]
    fn test_manifest_round_trip() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let manifest = WorkerManifest {
            config: RunConfiguration { nb_cpus: 2, ..Default::default() },
            jobs: vec![job(dir.path(), "S1"), job(dir.path(), "S2")],
        };
        let path = dir.path().join("m.json");
        manifest.write(&path)?;
        assert_eq!(WorkerManifest::read(&path)?, manifest);
        Ok(())
    }

    #[test]
    fn test_worker_log_lines() {
        let stderr = "[2024-01-01 10:00:00] INFO: Processing sample B (Preprocess)\n\n[2024-01-01 10:00:01] INFO: done\r\n";
        assert_eq!(
            worker_log_lines(stderr),
            vec!["[2024-01-01 10:00:00] INFO: Processing sample B (Preprocess)", "[2024-01-01 10:00:01] INFO: done"]
        );
        assert!(worker_log_lines("").is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_empty() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let pool = WorkerPool::new(Arc::new(RunConfiguration::default()), dir.path());
        assert!(pool.dispatch(Vec::new(), &dir.path().join("log")).await?.is_empty());
        Ok(())
    }
}
