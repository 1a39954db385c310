use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

/// Either a plain or a gzip-decoded file.
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<BufReader<File>>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

impl FileReader {
    /// Opens a file, decompressing it on the fly when it starts with the gzip magic.
    pub fn open(path: &Path) -> io::Result<FileReader> {
        let gz = is_gzipped(path)?;
        let file = BufReader::new(File::open(path)?);
        if gz {
            Ok(FileReader::Gzipped(MultiGzDecoder::new(file)))
        } else {
            Ok(FileReader::Uncompressed(file))
        }
    }
}

/// Checks the two gzip magic bytes. Empty or one-byte files are not gzipped.
pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    let mut read = 0;
    while read < 2 {
        let n = file.read(&mut buffer[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(buffer == [0x1F, 0x8B])
}

/// Appends text to a log file, creating it if needed.
pub fn append_to_log(log: &Path, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(log)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

/// Appends several files to a log, each followed by a blank line.
///
/// # Arguments
///
/// * `log` - Destination log.
/// * `appended` - Files to copy, in order. Missing files are skipped.
pub fn append_files_to_log(log: &Path, appended: &[PathBuf]) -> io::Result<()> {
    let mut out = OpenOptions::new().create(true).append(true).open(log)?;
    out.write_all(b"\n")?;
    for path in appended {
        if !path.exists() {
            continue;
        }
        let mut input = File::open(path)?;
        io::copy(&mut input, &mut out)?;
        out.write_all(b"\n")?;
    }
    out.write_all(b"\n")?;
    Ok(())
}

/// Last `n` lines of a text, used to keep error messages short.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Reads the first line of a file, without its line terminator.
pub fn first_line(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Removes a file, ignoring files that are already gone.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn test_is_gzipped() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let plain = dir.path().join("a.fasta");
        fs::write(&plain, ">a\nACGT\n")?;
        let gz = dir.path().join("a.fasta.gz");
        let mut enc = GzEncoder::new(File::create(&gz)?, Compression::default());
        enc.write_all(b">a\nACGT\n")?;
        enc.finish()?;
        let empty = dir.path().join("empty");
        File::create(&empty)?;

        assert!(!is_gzipped(&plain)?);
        assert!(is_gzipped(&gz)?);
        assert!(!is_gzipped(&empty)?);

        let mut content = String::new();
        FileReader::open(&gz)?.read_to_string(&mut content)?;
        assert_eq!(content, ">a\nACGT\n");
        Ok(())
    }

    #[test]
    fn test_append_files_to_log() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("run.log");
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        fs::write(&log, "## Application\n")?;
        fs::write(&a, "##Sample\nA\n")?;
        fs::write(&b, "##Sample\nB\n")?;
        append_files_to_log(&log, &[a, dir.path().join("missing.log"), b])?;
        assert_eq!(fs::read_to_string(&log)?, "## Application\n\n##Sample\nA\n\n##Sample\nB\n\n\n");
        Ok(())
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
