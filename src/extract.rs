use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tracing::{debug, info, warn};

use crate::error::MolidError;

const RECORD_TERMINATOR: &str = "$$$$";

/// Decodes the whole gzip stream; a truncated or damaged archive fails here.
pub fn validate_gzip(archive: &Path) -> Result<(), MolidError> {
    let bytes = inflate(archive, &mut io::sink())?;
    debug!(archive = %archive.display(), bytes, "archive validated");
    Ok(())
}

/// Where `unpack` writes the decompressed copy of `archive`.
pub fn staged_path(archive: &Path, staging_dir: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive.sdf.gz".to_string());
    let stem = name.strip_suffix(".gz").unwrap_or(&name);
    staging_dir.join(stem)
}

/// Decompresses `archive` into the staging directory, validating the stream on
/// the way. A corrupt archive leaves no staged file behind.
pub fn unpack(archive: &Path, staging_dir: &Path) -> Result<PathBuf, MolidError> {
    fs::create_dir_all(staging_dir).map_err(|err| MolidError::Filesystem(err.to_string()))?;
    let target = staged_path(archive, staging_dir);
    let file = File::create(&target).map_err(|err| MolidError::Filesystem(err.to_string()))?;
    let mut output = BufWriter::new(file);
    let inflated = inflate(archive, &mut output).and_then(|bytes| {
        output
            .flush()
            .map_err(|err| MolidError::Filesystem(err.to_string()))?;
        Ok(bytes)
    });
    drop(output);
    match inflated {
        Ok(bytes) => {
            info!(archive = %archive.display(), target = %target.display(), bytes, "archive unpacked");
            Ok(target)
        }
        Err(err) => {
            cleanup(&[target.as_path()]);
            Err(err)
        }
    }
}

/// Unpacks `archive` and streams its records one block at a time.
pub fn extract(
    archive: &Path,
    staging_dir: &Path,
) -> Result<SdfRecords<BufReader<File>>, MolidError> {
    let sdf_path = unpack(archive, staging_dir)?;
    SdfRecords::open(&sdf_path)
}

/// Pull-based iterator over raw SDF record blocks (without the `$$$$` line).
pub struct SdfRecords<R> {
    reader: R,
    source: PathBuf,
    buffer: Vec<u8>,
    finished: bool,
}

impl SdfRecords<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, MolidError> {
        let file = File::open(path).map_err(|err| corrupt(path, format!("open: {err}")))?;
        Ok(Self::new(BufReader::new(file), path))
    }
}

impl<R: BufRead> SdfRecords<R> {
    pub fn new(reader: R, source: &Path) -> Self {
        Self {
            reader,
            source: source.to_path_buf(),
            buffer: Vec::new(),
            finished: false,
        }
    }
}

impl<R: BufRead> Iterator for SdfRecords<R> {
    type Item = Result<String, MolidError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut block = String::new();
        loop {
            self.buffer.clear();
            let read = match self.reader.read_until(b'\n', &mut self.buffer) {
                Ok(read) => read,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(corrupt(&self.source, err)));
                }
            };
            if read == 0 {
                self.finished = true;
                return (!block.trim().is_empty()).then_some(Ok(block));
            }
            let line = String::from_utf8_lossy(&self.buffer);
            if line.trim_end() == RECORD_TERMINATOR {
                return Some(Ok(block));
            }
            block.push_str(&line);
        }
    }
}

/// Removes downloaded and staged artifacts; failures are logged, never raised.
pub fn cleanup(paths: &[&Path]) {
    for path in paths {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else if path.exists() {
            fs::remove_file(path)
        } else {
            continue;
        };
        match result {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(err) => warn!(path = %path.display(), error = %err, "cleanup failed"),
        }
    }
}

/// Streams the decoded archive into `output`. Decode errors and a missing trailer
/// are `CorruptArchive`; write errors are `Filesystem`.
fn inflate<W: Write>(archive: &Path, output: &mut W) -> Result<u64, MolidError> {
    let file = File::open(archive).map_err(|err| corrupt(archive, format!("open: {err}")))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(corrupt(archive, err)),
        };
        output
            .write_all(&buffer[..read])
            .map_err(|err| MolidError::Filesystem(err.to_string()))?;
        total += read as u64;
    }
    if total == 0 {
        return Err(corrupt(archive, "archive decodes to zero bytes"));
    }
    Ok(total)
}

fn corrupt(path: &Path, reason: impl ToString) -> MolidError {
    MolidError::CorruptArchive {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn records_split_on_terminator() {
        let data = "one\nM  END\n$$$$\ntwo\nM  END\n$$$$\n";
        let records: Vec<String> = SdfRecords::new(Cursor::new(data), Path::new("mem"))
            .map(|record| record.unwrap())
            .collect();
        assert_eq!(records, vec!["one\nM  END\n", "two\nM  END\n"]);
    }

    #[test]
    fn trailing_block_without_terminator_is_kept() {
        let data = "one\n$$$$\ntail\n\n";
        let records: Vec<String> = SdfRecords::new(Cursor::new(data), Path::new("mem"))
            .map(|record| record.unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], "tail\n\n");
    }

    #[test]
    fn truncated_gzip_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&b"record\n$$$$\n".repeat(200)).unwrap();
        let bytes = encoder.finish().unwrap();

        let good = temp.path().join("good.sdf.gz");
        fs::write(&good, &bytes).unwrap();
        validate_gzip(&good).unwrap();

        let truncated = temp.path().join("bad.sdf.gz");
        fs::write(&truncated, &bytes[..bytes.len() - 6]).unwrap();
        let err = validate_gzip(&truncated).unwrap_err();
        assert!(matches!(err, MolidError::CorruptArchive { .. }));

        let staging = temp.path().join("staging");
        let err = unpack(&truncated, &staging).unwrap_err();
        assert!(matches!(err, MolidError::CorruptArchive { .. }));
        assert!(!staged_path(&truncated, &staging).exists());

        let staged = unpack(&good, &staging).unwrap();
        assert_eq!(fs::read(staged).unwrap(), b"record\n$$$$\n".repeat(200));
    }

    #[test]
    fn staged_path_drops_gz_suffix() {
        let staged = staged_path(Path::new("/dl/Compound_1.sdf.gz"), Path::new("/stage"));
        assert_eq!(staged, Path::new("/stage/Compound_1.sdf"));
    }
}
