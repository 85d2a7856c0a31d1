//! Selective extraction from plain or gzipped tar archives.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, warn};

use super::ExtractError;

/// Extract the named regular-file entries of `archive_path` into `dest`.
///
/// Each match is written to `dest/<basename>`. Entry names are compared
/// after dropping a leading `./`. Fails with [`ExtractError::MissingEntries`]
/// if the archive ends before every name was seen. Files written before a
/// failure are left in place for the caller to discard.
pub fn extract_entries(
    archive_path: &Path,
    wanted: &[String],
    dest: &Path,
) -> Result<Vec<PathBuf>, ExtractError> {
    let read_err = |source: io::Error| ExtractError::ArchiveRead {
        archive: archive_path.to_path_buf(),
        source,
    };

    let mut archive = open_archive(archive_path).map_err(read_err)?;
    let mut remaining: BTreeSet<&str> = wanted.iter().map(String::as_str).collect();
    let mut written = Vec::with_capacity(wanted.len());

    for entry in archive.entries().map_err(read_err)? {
        if remaining.is_empty() {
            break;
        }
        let mut entry = entry.map_err(read_err)?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }

        let path = entry.path().map_err(read_err)?.into_owned();
        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping path with parent directory");
            continue;
        }
        let name = path.to_string_lossy();
        let name = name.strip_prefix("./").unwrap_or(&name);
        if !remaining.remove(name) {
            continue;
        }

        let Some(file_name) = path.file_name() else {
            continue;
        };
        let out_path = dest.join(file_name);
        let mut out = File::create(&out_path).map_err(|source| ExtractError::Io {
            path: out_path.clone(),
            source,
        })?;
        io::copy(&mut entry, &mut out).map_err(read_err)?;

        debug!(entry = %name, dest = %out_path.display(), "Extracted archive entry");
        written.push(out_path);
    }

    if !remaining.is_empty() {
        return Err(ExtractError::MissingEntries {
            archive: archive_path.to_path_buf(),
            missing: remaining.into_iter().map(str::to_string).collect(),
        });
    }

    Ok(written)
}

/// Open a tar archive, transparently gunzipping it when compressed.
fn open_archive(path: &Path) -> io::Result<Archive<Box<dyn Read>>> {
    let reader = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = if is_gzip(path)? {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(Archive::new(reader))
}

/// Check if a file is gzip compressed.
pub fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}

/// Remove files, ignoring ones that are already gone.
pub(crate) fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove partial extraction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::testutil::{write_tar, write_tar_gz};
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extracts_requested_entries_from_gzip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("layer.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("opt/bin/minio", b"binary".as_slice()),
                ("opt/bin/other", b"x".as_slice()),
                ("opt/bin/minio.sha256sum", b"sum".as_slice()),
            ],
        );

        let written = extract_entries(
            &archive,
            &names(&["opt/bin/minio", "opt/bin/minio.sha256sum"]),
            dir.path(),
        )
        .unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(fs::read(dir.path().join("minio")).unwrap(), b"binary");
        assert_eq!(fs::read(dir.path().join("minio.sha256sum")).unwrap(), b"sum");
        assert!(!dir.path().join("other").exists());
    }

    #[test]
    fn test_extracts_from_plain_tar() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("image.tar");
        write_tar(&archive, &[("./abc.tar.gz", b"nested".as_slice())]);

        extract_entries(&archive, &names(&["abc.tar.gz"]), dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("abc.tar.gz")).unwrap(), b"nested");
    }

    #[test]
    fn test_missing_entries_reports_what_was_missing() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("layer.tar.gz");
        write_tar_gz(&archive, &[("opt/bin/minio", b"binary".as_slice())]);

        let err = extract_entries(
            &archive,
            &names(&["opt/bin/minio", "opt/bin/minio.minisig"]),
            dir.path(),
        )
        .unwrap_err();

        match err {
            ExtractError::MissingEntries { missing, .. } => {
                assert_eq!(missing, vec!["opt/bin/minio.minisig".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_corrupt_header_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.tar");
        fs::write(&archive, [b'a'; 512]).unwrap();

        let err = extract_entries(&archive, &names(&["a"]), dir.path()).unwrap_err();
        assert!(matches!(err, ExtractError::ArchiveRead { .. }));
    }

    #[test]
    fn test_is_gzip() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("a");
        write_tar_gz(&gz, &[("x", b"1".as_slice())]);
        let plain = dir.path().join("b");
        write_tar(&plain, &[("x", b"1".as_slice())]);
        let tiny = dir.path().join("c");
        fs::write(&tiny, [0x1f]).unwrap();

        assert!(is_gzip(&gz).unwrap());
        assert!(!is_gzip(&plain).unwrap());
        assert!(!is_gzip(&tiny).unwrap());
    }
}
