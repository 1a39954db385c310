use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::{debug, warn};

use crate::config::defs::PipelineError;

/// One registered path. `index` is its position in the owning registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempFile {
    pub index: usize,
    pub path: PathBuf,
}

/// Owns the ephemeral files of one unit of work (the run, or one sample
/// inside a worker). Files live in a private directory created under the
/// given parent, so two registries never hand out the same path.
#[derive(Debug)]
pub struct TempFileRegistry {
    dir: PathBuf,
    files: Vec<PathBuf>,
    names: HashSet<String>,
    retained: bool,
    released: bool,
}

impl TempFileRegistry {
    /// Creates a registry rooted in a fresh directory under `parent`.
    ///
    /// # Arguments
    ///
    /// * `parent` - Existing directory that will hold the registry directory.
    /// * `prefix` - Prefix of the registry directory name.
    /// * `retained` - Debug mode: nothing is ever removed.
    pub fn new(parent: &Path, prefix: &str, retained: bool) -> Result<Self, PipelineError> {
        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(parent)?
            .into_path();
        debug!("Temporary files of {} go to {}", prefix.trim_end_matches('_'), dir.display());
        Ok(TempFileRegistry {
            dir,
            files: Vec::new(),
            names: HashSet::new(),
            retained,
            released: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Registers `name` and returns its path inside the registry directory.
    /// A name can only be handed out once.
    pub fn add(&mut self, name: &str) -> Result<TempFile, PipelineError> {
        if name.is_empty() || name.contains(std::path::MAIN_SEPARATOR) {
            return Err(PipelineError::Other(anyhow!("Invalid temporary file name '{}'", name)));
        }
        if !self.names.insert(name.to_string()) {
            return Err(PipelineError::Other(anyhow!(
                "Temporary file '{}' is already registered in {}",
                name,
                self.dir.display()
            )));
        }
        let path = self.dir.join(name);
        self.files.push(path.clone());
        Ok(TempFile { index: self.files.len() - 1, path })
    }

    /// Path of a previously registered file.
    pub fn get(&self, index: usize) -> Option<&Path> {
        self.files.get(index).map(PathBuf::as_path)
    }

    /// Removes every registered file, then the registry directory when it is
    /// empty. Does nothing in debug mode. Safe to call more than once.
    pub fn delete_all(&mut self) -> io::Result<()> {
        if self.retained || self.released {
            return Ok(());
        }
        self.released = true;
        let mut first_error = None;
        for path in &self.files {
            let removed = if path.is_dir() { fs::remove_dir_all(path) } else { fs::remove_file(path) };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Could not remove {}: {}", path.display(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if fs::read_dir(&self.dir).map(|mut d| d.next().is_none()).unwrap_or(false) {
            fs::remove_dir(&self.dir)?;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for TempFileRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.delete_all() {
            warn!("Temporary files of {} were not all removed: {}", self.dir.display(), e);
        }
    }
}
