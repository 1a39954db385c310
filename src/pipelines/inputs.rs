/// Turning the command line inputs into samples

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use tar::Archive;

use crate::config::defs::{PipelineError, FASTA_TAG, FASTQ_TAG};
use crate::config::run::{check_unique_names, default_sample_name, SampleSource};
use crate::pipelines::sample::Sample;
use crate::utils::fastx::detect_format;
use crate::utils::file::{append_to_log, is_gzipped};
use crate::utils::tempfiles::TempFileRegistry;

const GALAXY_EXT: &str = ".dat";

lazy_static! {
    static ref R1_MARK: Option<Regex> = Regex::new("_[Rr]1").ok();
    static ref R2_MARK: Option<Regex> = Regex::new("_[Rr]2").ok();
}

enum ReadSide {
    R1,
    R2,
}

/// Resolves the samples of a run.
///
/// # Arguments
///
/// * `source` - Archive or explicit file lists.
/// * `contiged` - True when every sample is a single file.
/// * `registry` - Run registry; extracted files and Galaxy links belong to it.
/// * `log` - Run log, receives the Galaxy link commands.
///
/// # Returns
/// Samples in processing order, names unique.
pub fn resolve_samples(
    source: &SampleSource,
    contiged: bool,
    registry: &mut TempFileRegistry,
    log: &Path,
) -> Result<Vec<Sample>, PipelineError> {
    let samples = match source {
        SampleSource::Archive(archive) => samples_from_tar(archive, contiged, registry)?,
        SampleSource::Files { r1, r2, names } => {
            let mut logged = false;
            let r1_links = link_galaxy_inputs(r1, registry, log, &mut logged)?;
            let r2_links = match r2 {
                Some(r2) if !contiged => Some(link_galaxy_inputs(r2, registry, log, &mut logged)?),
                _ => None,
            };
            let names: Vec<String> = match names {
                Some(names) => names.clone(),
                None => r1.iter().map(|p| default_sample_name(p)).collect(),
            };
            names
                .into_iter()
                .enumerate()
                .map(|(idx, name)| Sample {
                    name,
                    read1: r1_links[idx].clone(),
                    read2: r2_links.as_ref().and_then(|r2| r2.get(idx).cloned()),
                })
                .collect::<Vec<_>>()
        }
    };

    let names: Vec<String> = samples.iter().map(|s| s.name.clone()).collect();
    check_unique_names(&names).map_err(|_| {
        PipelineError::config("Impossible to retrieve unique samples names from files. The sample name must be before the first dot.")
    })?;
    info!("{} samples to process", samples.len());
    Ok(samples)
}

/// Galaxy hands files over as `<id>.dat`; tools choose their parser from the
/// extension, so those inputs are linked under a name carrying the real format.
fn link_galaxy_inputs(
    files: &[PathBuf],
    registry: &mut TempFileRegistry,
    log: &Path,
    logged: &mut bool,
) -> Result<Vec<PathBuf>, PipelineError> {
    let mut out = Vec::with_capacity(files.len());
    for file in files {
        if !file.to_string_lossy().ends_with(GALAXY_EXT) {
            out.push(file.clone());
            continue;
        }
        if !*logged {
            append_to_log(log, "##Create symlink for Galaxy inputs\n")?;
            *logged = true;
        }
        let detected = detect_format(file).map_err(|e| PipelineError::config(format!("{}: {}", file.display(), e)))?;
        let format = match detected {
            Some(FASTQ_TAG) => FASTQ_TAG,
            Some(FASTA_TAG) => FASTA_TAG,
            _ => {
                return Err(PipelineError::config(format!(
                    "{} is neither a fasta or a fastq file",
                    file.display()
                )))
            }
        };
        let gz = if is_gzipped(file)? { ".gz" } else { "" };
        let base = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let link = registry.add(&format!("{}.{}{}", base, format, gz))?;
        symlink(file, &link.path)?;
        append_to_log(log, &format!("\tln -s {} {}\n", file.display(), link.path.display()))?;
        out.push(link.path);
    }
    Ok(out)
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::fs::copy(original, link).map(|_| ())
}

fn open_archive(archive: &Path) -> Result<Archive<Box<dyn Read>>, PipelineError> {
    let file = BufReader::new(File::open(archive)?);
    let reader: Box<dyn Read> = if is_gzipped(archive)? { Box::new(GzDecoder::new(file)) } else { Box::new(file) };
    Ok(Archive::new(reader))
}

fn classify(name: &str) -> Option<(ReadSide, String)> {
    let r1 = R1_MARK.as_ref()?;
    let r2 = R2_MARK.as_ref()?;
    if let Some(m) = r1.find(name) {
        return Some((ReadSide::R1, name[..m.start()].to_string()));
    }
    if let Some(m) = r2.find(name) {
        return Some((ReadSide::R2, name[..m.start()].to_string()));
    }
    None
}

/// Extracts one file per sample (contiged) or `_R1`/`_R2` pairs from a tar
/// archive, gzipped or not. Pairs are matched on the name before the read mark.
fn samples_from_tar(archive: &Path, contiged: bool, registry: &mut TempFileRegistry) -> Result<Vec<Sample>, PipelineError> {
    let mut tar = open_archive(archive)?;
    let mut r1_by_name: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut r2_by_name: BTreeMap<String, PathBuf> = BTreeMap::new();

    let entries = tar
        .entries()
        .map_err(|e| PipelineError::config(format!("The archive '{}' is not a tar file: {}", archive.display(), e)))?;
    for entry in entries {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let components: Vec<Component> = entry_path.components().filter(|c| *c != Component::CurDir).collect();
        if !entry.header().entry_type().is_file() || components.len() != 1 {
            return Err(PipelineError::config(format!(
                "The archive '{}' must not contain folders.",
                archive.display()
            )));
        }
        let name = components[0].as_os_str().to_string_lossy().into_owned();

        let (side, sample_name) = if contiged {
            (ReadSide::R1, name.split('.').next().unwrap_or_default().to_string())
        } else {
            classify(&name).ok_or_else(|| {
                PipelineError::config(format!(
                    "The file '{}' in archive '{}' is invalid. The files names must contain '_R1' or '_R2'.",
                    name,
                    archive.display()
                ))
            })?
        };
        let target = registry.add(&name)?;
        entry.unpack(&target.path)?;
        debug!("Extracted {} for sample {}", name, sample_name);

        let previous = match side {
            ReadSide::R1 => r1_by_name.insert(sample_name.clone(), target.path),
            ReadSide::R2 => r2_by_name.insert(sample_name.clone(), target.path),
        };
        if previous.is_some() {
            return Err(PipelineError::config(format!(
                "Impossible to retrieve unique samples names from archive '{}' (duplicated: {}).",
                archive.display(),
                sample_name
            )));
        }
    }

    if !contiged {
        let r1_names: Vec<&String> = r1_by_name.keys().collect();
        let r2_names: Vec<&String> = r2_by_name.keys().collect();
        if r1_names != r2_names {
            return Err(PipelineError::DataIntegrity(format!(
                "Samples names are not identical in the archive '{}'. R1 samples names : [{}] ; R2 samples names : [{}]",
                archive.display(),
                r1_names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
                r2_names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }
    }

    Ok(r1_by_name
        .into_iter()
        .map(|(name, read1)| {
            let read2 = r2_by_name.remove(&name);
            Sample { name, read1, read2 }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::ErrorKind;
    use std::io::Write;

    fn build_tar(path: &Path, files: &[(&str, &str)]) -> std::io::Result<()> {
        let mut builder = tar::Builder::new(File::create(path)?);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes())?;
        }
        builder.finish()
    }

    #[test]
    fn test_classify() {
        assert!(matches!(classify("S1_R1.fastq.gz"), Some((ReadSide::R1, n)) if n == "S1"));
        assert!(matches!(classify("S_2_r2_001.fq"), Some((ReadSide::R2, n)) if n == "S_2"));
        assert!(classify("S1.fastq").is_none());
    }

    #[test]
    fn test_paired_archive() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("reads.tar");
        build_tar(
            &archive,
            &[
                ("B_R1.fastq", "@b\nACGT\n+\nIIII\n"),
                ("A_R2.fastq", "@a\nACGT\n+\nIIII\n"),
                ("A_R1.fastq", "@a\nACGT\n+\nIIII\n"),
                ("B_R2.fastq", "@b\nACGT\n+\nIIII\n"),
            ],
        )?;
        let mut registry = TempFileRegistry::new(dir.path(), "run_", false)?;
        let log = dir.path().join("run.log");
        let samples = resolve_samples(&SampleSource::Archive(archive), false, &mut registry, &log)?;
        let names: Vec<&str> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(samples[0].read1.ends_with("A_R1.fastq"));
        assert!(samples[0].read2.as_ref().is_some_and(|p| p.ends_with("A_R2.fastq")));
        assert!(samples[1].read1.exists());
        Ok(())
    }

    #[test]
    fn test_mismatched_archive() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("reads.tar");
        build_tar(&archive, &[("A_R1.fastq", "@a\nA\n+\nI\n"), ("B_R2.fastq", "@b\nA\n+\nI\n")])?;
        let mut registry = TempFileRegistry::new(dir.path(), "run_", false)?;
        let err = resolve_samples(&SampleSource::Archive(archive), false, &mut registry, &dir.path().join("log"));
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::DataIntegrity));
        Ok(())
    }

    #[test]
    fn test_unclassified_archive_member() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("reads.tar");
        build_tar(&archive, &[("A.fastq", "@a\nA\n+\nI\n")])?;
        let mut registry = TempFileRegistry::new(dir.path(), "run_", false)?;
        let err = resolve_samples(&SampleSource::Archive(archive), false, &mut registry, &dir.path().join("log"));
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Configuration));
        Ok(())
    }

    #[test]
    fn test_contiged_gzipped_archive() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let plain = dir.path().join("reads.tar");
        build_tar(&plain, &[("S1.fasta", ">a\nACGT\n"), ("S2.fasta", ">b\nACGT\n")])?;
        let archive = dir.path().join("reads.tar.gz");
        let mut enc = flate2::write::GzEncoder::new(File::create(&archive)?, flate2::Compression::default());
        enc.write_all(&std::fs::read(&plain)?)?;
        enc.finish()?;

        let mut registry = TempFileRegistry::new(dir.path(), "run_", false)?;
        let samples = resolve_samples(&SampleSource::Archive(archive), true, &mut registry, &dir.path().join("log"))?;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].name, "S2");
        assert!(samples[1].read2.is_none());
        Ok(())
    }

    #[test]
    fn test_explicit_files_and_galaxy_links() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let r1 = dir.path().join("dataset_12.dat");
        std::fs::write(&r1, "@a\nACGT\n+\nIIII\n")?;
        let plain = dir.path().join("S2.fasta");
        std::fs::write(&plain, ">a\nACGT\n")?;
        let log = dir.path().join("run.log");
        let mut registry = TempFileRegistry::new(dir.path(), "run_", false)?;

        let source = SampleSource::Files { r1: vec![r1.clone(), plain.clone()], r2: None, names: None };
        let samples = resolve_samples(&source, true, &mut registry, &log)?;
        assert_eq!(samples[0].name, "dataset_12");
        assert!(samples[0].read1.to_string_lossy().ends_with("dataset_12.dat.fastq"));
        assert_eq!(samples[1].read1, plain);
        let content = std::fs::read_to_string(&log)?;
        assert!(content.starts_with("##Create symlink for Galaxy inputs\n\tln -s "));
        Ok(())
    }

    #[test]
    fn test_duplicate_default_names() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let mut registry = TempFileRegistry::new(dir.path(), "run_", false)?;
        let source = SampleSource::Files {
            r1: vec![PathBuf::from("/a/S1.R1.fastq"), PathBuf::from("/b/S1.fastq")],
            r2: None,
            names: None,
        };
        let err = resolve_samples(&source, true, &mut registry, &dir.path().join("log"));
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Configuration));
        Ok(())
    }
}
