use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use seq_io::fasta::{OwnedRecord as FastaOwnedRecord, Reader as FastaReader, Record as _};
use seq_io::fastq::{OwnedRecord as FastqOwnedRecord, Reader as FastqReader, Record as _};

use crate::config::defs::{PipelineError, COMBINED_TAG, FASTA_TAG, FASTQ_TAG, SIZE_SEPARATOR, SPACER_CHAR, SPACER_LENGTH};
use crate::utils::file::FileReader;

const N_TAG_PATTERN: &str = r"50A50C:(\d+):(\d+)$";

lazy_static! {
    static ref SPACER: String = SPACER_CHAR.to_string().repeat(SPACER_LENGTH);
    static ref PLACEHOLDER: String = format!("{}{}", "A".repeat(SPACER_LENGTH / 2), "C".repeat(SPACER_LENGTH / 2));
}

/// Defines FASTA and FASTQ as part of a unified FASTX structure.
#[derive(Clone, Debug, PartialEq)]
pub enum SequenceRecord {
    Fasta {
        id: String,
        desc: Option<String>,
        seq: Vec<u8>,
    },
    Fastq {
        id: String,
        desc: Option<String>,
        seq: Vec<u8>,
        qual: Vec<u8>,
    },
}

impl SequenceRecord {
    pub fn id(&self) -> &str {
        match self {
            SequenceRecord::Fasta { id, .. } => id,
            SequenceRecord::Fastq { id, .. } => id,
        }
    }

    pub fn seq(&self) -> &[u8] {
        match self {
            SequenceRecord::Fasta { seq, .. } => seq,
            SequenceRecord::Fastq { seq, .. } => seq,
        }
    }
}

impl From<FastaOwnedRecord> for SequenceRecord {
    fn from(record: FastaOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '>');
        SequenceRecord::Fasta {
            id,
            desc,
            seq: record.seq,
        }
    }
}

impl From<FastqOwnedRecord> for SequenceRecord {
    fn from(record: FastqOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '@');
        SequenceRecord::Fastq {
            id,
            desc,
            seq: record.seq,
            qual: record.qual,
        }
    }
}

/// Enum to hold either FASTA or FASTQ reader
pub enum SequenceReader {
    Fasta(FastaReader<BufReader<FileReader>>),
    Fastq(FastqReader<BufReader<FileReader>>),
}

impl SequenceReader {
    /// Drains the reader into owned records.
    pub fn records(self) -> io::Result<Vec<SequenceRecord>> {
        let mut out = Vec::new();
        match self {
            SequenceReader::Fasta(reader) => {
                for record in reader.into_records() {
                    let record = record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    out.push(record.into());
                }
            }
            SequenceReader::Fastq(reader) => {
                for record in reader.into_records() {
                    let record = record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    out.push(record.into());
                }
            }
        }
        Ok(out)
    }
}

/// Creates a SequenceReader for either FASTA or FASTQ files, gzipped or not.
/// The format is read from the first byte of the content, so extensionless
/// files work. An empty file reads as an empty FASTA.
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file.
///
/// # Returns
/// io::Result<SequenceReader>: Result bearing the correct SequenceReader.
///
pub fn sequence_reader(path: &Path) -> io::Result<SequenceReader> {
    let mut reader = BufReader::new(FileReader::open(path)?);
    let format = sniff_format(&mut reader)?;
    match format {
        Some(FASTQ_TAG) => Ok(SequenceReader::Fastq(FastqReader::new(reader))),
        Some(_) | None => Ok(SequenceReader::Fasta(FastaReader::new(reader))),
    }
}

/// Detects the format of a sequence file from its content.
///
/// # Returns
/// `Some("fasta")`, `Some("fastq")`, or `None` for empty input. Other leading
/// characters are an error.
pub fn detect_format(path: &Path) -> io::Result<Option<&'static str>> {
    let mut reader = BufReader::new(FileReader::open(path)?);
    sniff_format(&mut reader)
}

fn sniff_format<R: BufRead>(reader: &mut R) -> io::Result<Option<&'static str>> {
    let buf = reader.fill_buf()?;
    match buf.iter().find(|b| !b.is_ascii_whitespace()) {
        None => Ok(None),
        Some(b'>') => Ok(Some(FASTA_TAG)),
        Some(b'@') => Ok(Some(FASTQ_TAG)),
        Some(other) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("neither a fasta nor a fastq file (starts with {:?})", *other as char),
        )),
    }
}

pub fn write_fasta_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
) -> io::Result<()> {
    writer.write_all(b">")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;
    writer.write_all(seq)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Parses a FASTX header.
///
/// # Arguments
///
/// * `head` - Header line of a FASTX record.
/// * 'prefix' - Leading, defining character of the header. > for FASTA, @ for FASTQ.
///
/// # Returns
/// Tuple: (id, desc) split of header on whitespace.
///
fn parse_header(head: &[u8], prefix: char) -> (String, Option<String>) {
    let head_str = String::from_utf8_lossy(head).into_owned();
    let parts: Vec<&str> = head_str.splitn(2, |c: char| c.is_whitespace()).collect();
    let id = parts[0].trim_start_matches(prefix).to_string();
    let desc = parts.get(1).map(|s| s.to_string()).filter(|s| !s.is_empty());
    (id, desc)
}

/// Abundance carried by a sequence id: the `;size=N` suffix, or 1.
pub fn abundance_from_id(id: &str, size_separator: &str) -> u64 {
    id.rsplit_once(size_separator)
        .and_then(|(_, size)| size.parse::<u64>().ok())
        .unwrap_or(1)
}

/// Number of reads represented by a FASTA/FASTQ file (gzip aware).
/// Dereplicated records count for their `;size=` abundance.
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file.
///
/// # Returns
/// u64: Number of reads represented.
///
pub fn count_sequences(path: &Path) -> io::Result<u64> {
    let mut counter = 0u64;
    let mut add = |head: &[u8]| {
        let (id, _) = parse_header(head, ' ');
        counter += abundance_from_id(&id, SIZE_SEPARATOR);
    };
    match sequence_reader(path)? {
        SequenceReader::Fasta(mut reader) => {
            while let Some(record) = reader.next() {
                let record = record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                add(record.head());
            }
        }
        SequenceReader::Fastq(mut reader) => {
            while let Some(record) = reader.next() {
                let record = record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                add(record.head());
            }
        }
    }
    Ok(counter)
}

/// Number of reads by sequence length.
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file.
/// * `size_separator` - When set, each record counts for the abundance in its id.
///
/// # Returns
/// length -> number of reads
pub fn length_histogram(path: &Path, size_separator: Option<&str>) -> io::Result<BTreeMap<usize, u64>> {
    let mut histogram = BTreeMap::new();
    for record in sequence_reader(path)?.records()? {
        let count = size_separator.map(|sep| abundance_from_id(record.id(), sep)).unwrap_or(1);
        *histogram.entry(record.seq().len()).or_insert(0) += count;
    }
    Ok(histogram)
}

/// Replaces the 100 N spacer of artificially combined reads by 50 A and 50 C,
/// recording the spacer coordinates in the description. Clustering tools
/// would otherwise treat the Ns as ambiguous bases.
pub fn replace_n_tags(in_fasta: &Path, out_fasta: &Path) -> Result<(), PipelineError> {
    let mut writer = BufWriter::new(File::create(out_fasta)?);
    for record in sequence_reader(in_fasta)?.records()? {
        let (id, mut desc, mut seq) = match record {
            SequenceRecord::Fasta { id, desc, seq } => (id, desc, seq),
            SequenceRecord::Fastq { id, desc, seq, .. } => (id, desc, seq),
        };
        if id.contains(COMBINED_TAG) {
            let text = String::from_utf8_lossy(&seq).into_owned();
            let start = text.find(SPACER.as_str()).ok_or_else(|| {
                PipelineError::DataIntegrity(format!("record {} is a {} sequence but it does not contain the 100 N tag", id, COMBINED_TAG))
            })?;
            let first = text.find(SPACER_CHAR).unwrap_or(start);
            let last = text.rfind(SPACER_CHAR).unwrap_or(start + SPACER_LENGTH - 1);
            seq = text.replacen(SPACER.as_str(), PLACEHOLDER.as_str(), 1).into_bytes();
            let coords = format!("50A50C:{}:{}", first, last);
            desc = Some(match desc {
                Some(d) => format!("{} {}", d, coords),
                None => coords,
            });
        }
        write_fasta_record(&mut writer, &id, desc.as_deref(), &seq)?;
    }
    writer.flush()?;
    Ok(())
}

/// Puts back the N spacer recorded by `replace_n_tags` on cluster seeds.
pub fn restore_n_tags(in_fasta: &Path, out_fasta: &Path) -> Result<(), PipelineError> {
    let coords_re = Regex::new(N_TAG_PATTERN).map_err(anyhow::Error::from)?;
    let mut writer = BufWriter::new(File::create(out_fasta)?);
    for record in sequence_reader(in_fasta)?.records()? {
        let (id, mut desc, mut seq) = match record {
            SequenceRecord::Fasta { id, desc, seq } => (id, desc, seq),
            SequenceRecord::Fastq { id, desc, seq, .. } => (id, desc, seq),
        };
        if id.contains(COMBINED_TAG) {
            let current = desc.clone().unwrap_or_default();
            let caps = coords_re.captures(&current).ok_or_else(|| {
                PipelineError::DataIntegrity(format!("{} is a {} cluster but has no combining tag positions in its description", id, COMBINED_TAG))
            })?;
            let first: usize = caps[1].parse().map_err(|_| PipelineError::DataIntegrity(format!("bad tag start in {}", id)))?;
            let last: usize = caps[2].parse().map_err(|_| PipelineError::DataIntegrity(format!("bad tag end in {}", id)))?;
            if last >= seq.len() || first > last || &seq[first..=last] != PLACEHOLDER.as_bytes() {
                return Err(PipelineError::DataIntegrity(format!(
                    "{} is a {} cluster but has no 50 As followed by 50 Cs to replace with 100 Ns",
                    id, COMBINED_TAG
                )));
            }
            for base in &mut seq[first..=last] {
                *base = SPACER_CHAR as u8;
            }
            let whole = caps.get(0).map(|m| m.start()).unwrap_or(current.len());
            let remaining = current[..whole].trim_end().to_string();
            desc = if remaining.is_empty() { None } else { Some(remaining) };
        }
        write_fasta_record(&mut writer, &id, desc.as_deref(), &seq)?;
    }
    writer.flush()?;
    Ok(())
}

/// Id of a sequence without its abundance suffix.
pub fn strip_abundance<'a>(id: &'a str, size_separator: &str) -> &'a str {
    match id.rsplit_once(size_separator) {
        Some((base, size)) if size.parse::<u64>().is_ok() => base,
        _ => id,
    }
}

/// Renames each pilot-cluster seed `<id>_<total abundance of its cluster>`.
///
/// # Arguments
///
/// * `seeds` - Seeds of the pilot clustering, named after their first member or `Cluster_<n>`.
/// * `composition` - Pilot composition, one cluster per line, members separated by spaces.
/// * `out` - Resized seeds.
pub fn resize_seeds(seeds: &Path, composition: &Path, out: &Path) -> Result<(), PipelineError> {
    let clusters = read_composition(composition)?;
    let mut size_by_seed: HashMap<String, u64> = HashMap::new();
    for (idx, members) in clusters.iter().enumerate() {
        let total: u64 = members.iter().map(|m| member_abundance(m)).sum();
        size_by_seed.insert(format!("Cluster_{}", idx + 1), total);
        if let Some(first) = members.first() {
            size_by_seed.insert(strip_abundance(first, SIZE_SEPARATOR).to_string(), total);
        }
    }

    let mut writer = BufWriter::new(File::create(out)?);
    for record in sequence_reader(seeds)?.records()? {
        let base = strip_abundance(record.id(), SIZE_SEPARATOR);
        let total = size_by_seed.get(base).ok_or_else(|| {
            PipelineError::DataIntegrity(format!("seed {} is not the seed of any pilot cluster", record.id()))
        })?;
        write_fasta_record(&mut writer, &format!("{}_{}", base, total), None, record.seq())?;
    }
    writer.flush()?;
    Ok(())
}

/// Expands a clustering of pilot seeds into the read-level composition.
///
/// # Arguments
///
/// * `pilot_composition` - Composition of the distance 1 pass.
/// * `seeds_composition` - Composition of the final pass over resized seeds (`<id>_<size>`).
/// * `out` - One line per final cluster listing every pilot member.
pub fn aggregate_composition(pilot_composition: &Path, seeds_composition: &Path, out: &Path) -> Result<(), PipelineError> {
    let pilot = read_composition(pilot_composition)?;
    let mut by_seed: HashMap<String, String> = HashMap::new();
    for (idx, members) in pilot.iter().enumerate() {
        let line = members.join(" ");
        if let Some(first) = members.first() {
            by_seed.insert(strip_abundance(first, SIZE_SEPARATOR).to_string(), line.clone());
        }
        by_seed.insert(format!("Cluster_{}", idx + 1), line);
    }

    let mut writer = BufWriter::new(File::create(out)?);
    for members in read_composition(seeds_composition)? {
        let mut expanded = Vec::with_capacity(members.len());
        for seed in &members {
            let base = seed.rsplit_once('_').map(|(b, _)| b).unwrap_or(seed);
            let line = by_seed.get(base).ok_or_else(|| {
                PipelineError::DataIntegrity(format!("seed {} has no pilot cluster", seed))
            })?;
            expanded.push(line.as_str());
        }
        writeln!(writer, "{}", expanded.join(" "))?;
    }
    writer.flush()?;
    Ok(())
}

fn read_composition(path: &Path) -> io::Result<Vec<Vec<String>>> {
    let reader = BufReader::new(File::open(path)?);
    let mut clusters = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        clusters.push(line.split_whitespace().map(str::to_string).collect());
    }
    Ok(clusters)
}

fn member_abundance(member: &str) -> u64 {
    if member.contains(SIZE_SEPARATOR) {
        return abundance_from_id(member, SIZE_SEPARATOR);
    }
    abundance_from_id(member, "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;

    fn spacer_read(prefix: &str, suffix: &str) -> String {
        format!("{}{}{}", prefix, "N".repeat(100), suffix)
    }

    #[test]
    fn test_sequence_reader_sniffs_content() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let fq = dir.path().join("reads.dat");
        fs::write(&fq, "@r1\nACGT\n+\nIIII\n@r2\nAC\n+\nII\n")?;
        assert_eq!(detect_format(&fq)?, Some(FASTQ_TAG));
        let records = sequence_reader(&fq)?.records()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id(), "r2");

        let bad = dir.path().join("bad.txt");
        fs::write(&bad, "hello\n")?;
        assert!(detect_format(&bad).is_err());
        Ok(())
    }

    #[test]
    fn test_count_sequences() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let plain = dir.path().join("plain.fasta");
        fs::write(&plain, ">a\nACGT\n>b desc\nACGTT\n>c\nA\n")?;
        assert_eq!(count_sequences(&plain)?, 3);

        let derep = dir.path().join("derep.fasta");
        fs::write(&derep, ">a;size=10\nACGT\n>b;size=5\nACGTT\n")?;
        assert_eq!(count_sequences(&derep)?, 15);

        let gz = dir.path().join("reads.fastq.gz");
        let mut enc = GzEncoder::new(File::create(&gz)?, Compression::default());
        enc.write_all(b"@r1\nACGT\n+\nIIII\n@r2\nACG\n+\nIII\n")?;
        enc.finish()?;
        assert_eq!(count_sequences(&gz)?, 2);

        let empty = dir.path().join("empty.fasta");
        File::create(&empty)?;
        assert_eq!(count_sequences(&empty)?, 0);
        Ok(())
    }

    #[test]
    fn test_length_histogram() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("derep.fasta");
        fs::write(&path, ">a;size=3\nACGT\n>b;size=2\nTTTT\n>c;size=1\nAC\n")?;
        let plain = length_histogram(&path, None)?;
        assert_eq!(plain.get(&4), Some(&2));
        assert_eq!(plain.get(&2), Some(&1));
        let sized = length_histogram(&path, Some(SIZE_SEPARATOR))?;
        assert_eq!(sized.get(&4), Some(&5));
        assert_eq!(sized.get(&2), Some(&1));
        Ok(())
    }

    #[test]
    fn test_n_tags_are_restored() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("in.fasta");
        let replaced = dir.path().join("replaced.fasta");
        let restored = dir.path().join("restored.fasta");
        let combined = spacer_read("ACGTACGT", "TTGG");
        fs::write(&input, format!(">s1_FROGS_combined;size=4\n{}\n>s2;size=1\nACGT\n", combined))?;

        replace_n_tags(&input, &replaced)?;
        let records = sequence_reader(&replaced)?.records()?;
        assert!(!String::from_utf8_lossy(records[0].seq()).contains('N'));
        match &records[0] {
            SequenceRecord::Fasta { desc, .. } => assert_eq!(desc.as_deref(), Some("50A50C:8:107")),
            _ => panic!("expected fasta"),
        }

        restore_n_tags(&replaced, &restored)?;
        let records = sequence_reader(&restored)?.records()?;
        assert_eq!(String::from_utf8_lossy(records[0].seq()), combined);
        assert_eq!(records[1].seq(), b"ACGT");
        match &records[0] {
            SequenceRecord::Fasta { desc, .. } => assert!(desc.is_none()),
            _ => panic!("expected fasta"),
        }
        Ok(())
    }

    #[test]
    fn test_combined_read_without_spacer_is_rejected() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("in.fasta");
        fs::write(&input, ">s1_FROGS_combined\nACGTNNNACGT\n")?;
        let err = replace_n_tags(&input, &dir.path().join("out.fasta")).unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity(_)));
        Ok(())
    }

    #[test]
    fn test_resize_and_aggregate() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let pilot = dir.path().join("pilot.txt");
        fs::write(&pilot, "a;size=10 b;size=2\nc;size=4\nd;size=1 e;size=1 f;size=1\n")?;
        let seeds = dir.path().join("seeds.fasta");
        fs::write(&seeds, ">a;size=10\nACGT\n>c;size=4\nACGA\n>d;size=1\nTTTT\n")?;
        let resized = dir.path().join("resized.fasta");
        resize_seeds(&seeds, &pilot, &resized)?;
        let ids: Vec<String> = sequence_reader(&resized)?.records()?.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["a_12", "c_4", "d_3"]);

        let final_compo = dir.path().join("final.txt");
        fs::write(&final_compo, "a_12 c_4\nd_3\n")?;
        let out = dir.path().join("compo.tsv");
        aggregate_composition(&pilot, &final_compo, &out)?;
        assert_eq!(fs::read_to_string(&out)?, "a;size=10 b;size=2 c;size=4\nd;size=1 e;size=1 f;size=1\n");
        Ok(())
    }

    #[test]
    fn test_aggregate_composition_expands_to_reads() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let pilot = dir.path().join("pilot.txt");
        fs::write(&pilot, "x;size=3 y;size=1\nz;size=2\nw;size=1\n")?;
        let final_compo = dir.path().join("final.txt");
        // Seeds named after their pilot cluster or after their first member.
        fs::write(&final_compo, "Cluster_1_4 w_1\n\nz_2\n")?;
        let out = dir.path().join("compo.tsv");
        aggregate_composition(&pilot, &final_compo, &out)?;
        assert_eq!(fs::read_to_string(&out)?, "x;size=3 y;size=1 w;size=1\nz;size=2\n");

        fs::write(&final_compo, "v_7\n")?;
        let err = aggregate_composition(&pilot, &final_compo, &out).err();
        assert!(matches!(err, Some(PipelineError::DataIntegrity(_))));
        Ok(())
    }

    #[test]
    fn test_strip_abundance() {
        assert_eq!(strip_abundance("seq1;size=12", SIZE_SEPARATOR), "seq1");
        assert_eq!(strip_abundance("seq1", SIZE_SEPARATOR), "seq1");
        assert_eq!(abundance_from_id("x_7", "_"), 7);
    }
}
