// etcd-backup/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{AppError, Result};

/// A finished archive on disk.
#[derive(Debug, Clone)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// MD5 of the archive bytes, computed while they were written.
    pub md5: [u8; 16],
}

/// Forwards writes to `inner` while hashing and counting them.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Md5,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, hasher: Md5::new(), written: 0 }
    }

    fn finish(mut self) -> io::Result<([u8; 16], u64)> {
        self.inner.flush()?;
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&self.hasher.finalize());
        Ok((digest, self.written))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn archive_err(context: String) -> impl FnOnce(io::Error) -> AppError {
    move |e| AppError::Archive(format!("{}: {}", context, e))
}

/// Creates a GZipped TAR archive from a source directory.
///
/// Entry paths are relative to `source_dir`, so extracting the archive
/// reproduces the directory's contents at the extraction root.
///
/// # Arguments
/// * `source_dir` - The directory whose contents will be archived.
/// * `archive_dest_path` - Where the `.tar.gz` is written. Must not exist.
pub fn create_tar_gz_archive(source_dir: &Path, archive_dest_path: &Path) -> Result<ArchiveArtifact> {
    if !source_dir.is_dir() {
        return Err(AppError::Archive(format!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        )));
    }

    debug!(
        "Compressing backup directory {} into tarball {}",
        source_dir.display(),
        archive_dest_path.display()
    );

    let archive_file = File::options()
        .write(true)
        .create_new(true)
        .open(archive_dest_path)
        .map_err(archive_err(format!(
            "Failed to create archive file {}",
            archive_dest_path.display()
        )))?;
    let hashing = HashingWriter::new(BufWriter::new(archive_file));
    let enc = GzEncoder::new(hashing, Compression::default());
    let mut tar_builder = Builder::new(enc);
    tar_builder.follow_symlinks(false);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            AppError::Archive(format!("Failed to walk directory {}: {}", source_dir.display(), e))
        })?;
        let path = entry.path();
        let name = path.strip_prefix(source_dir).map_err(|e| {
            AppError::Archive(format!(
                "Failed to strip prefix {} from {}: {}",
                source_dir.display(),
                path.display(),
                e
            ))
        })?;

        if name.as_os_str().is_empty() {
            continue;
        }

        // walkdir already recurses, so directories are added as single entries.
        if entry.file_type().is_dir() {
            tar_builder
                .append_dir(name, path)
                .map_err(archive_err(format!("Failed to append directory {}", path.display())))?;
        } else {
            tar_builder
                .append_path_with_name(path, name)
                .map_err(archive_err(format!(
                    "Failed to append {} as {}",
                    path.display(),
                    name.display()
                )))?;
        }
    }

    let encoder = tar_builder
        .into_inner()
        .map_err(archive_err("Failed to finish tar stream".to_string()))?;
    let hashing = encoder
        .finish()
        .map_err(archive_err("Failed to finish gzip encoding".to_string()))?;
    let (md5, size_bytes) = hashing
        .finish()
        .map_err(archive_err(format!("Failed to flush {}", archive_dest_path.display())))?;

    debug!(
        "Tarball {} written: {} bytes, md5 {}",
        archive_dest_path.display(),
        size_bytes,
        hex::encode(md5)
    );
    Ok(ArchiveArtifact {
        path: archive_dest_path.to_path_buf(),
        size_bytes,
        md5,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::s3_upload::file_md5;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    /// Relative path -> contents for every regular file under `root`.
    fn tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                (rel, std::fs::read(e.path()).unwrap())
            })
            .collect()
    }

    fn snapshot_fixture(root: &Path) -> PathBuf {
        let snapshot = root.join("etcd-backup-2024-01-02-030405");
        write(&snapshot.join("member/snap/db"), &[7u8; 10_000]);
        write(&snapshot.join("member/wal/0000000000000000-0000000000000000.wal"), b"wal entries");
        std::fs::create_dir_all(snapshot.join("member/empty")).unwrap();
        snapshot
    }

    #[test]
    fn test_archive_round_trip() {
        let tmp = TempDir::new().unwrap();
        let snapshot = snapshot_fixture(tmp.path());
        let archive_path = tmp.path().join("backup.tar.gz");

        create_tar_gz_archive(&snapshot, &archive_path).unwrap();

        let extract_dir = tmp.path().join("extract");
        std::fs::create_dir_all(&extract_dir).unwrap();
        tar::Archive::new(GzDecoder::new(File::open(&archive_path).unwrap()))
            .unpack(&extract_dir)
            .unwrap();

        assert_eq!(tree(&extract_dir), tree(&snapshot));
        assert!(extract_dir.join("member/empty").is_dir());
    }

    #[test]
    fn test_entries_are_rooted_at_archive_root() {
        let tmp = TempDir::new().unwrap();
        let snapshot = snapshot_fixture(tmp.path());
        let archive_path = tmp.path().join("backup.tar.gz");

        create_tar_gz_archive(&snapshot, &archive_path).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&archive_path).unwrap()));
        let names: Vec<PathBuf> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().into_owned())
            .collect();

        assert!(names.contains(&PathBuf::from("member/snap/db")));
        assert!(names.iter().all(|n| n.starts_with("member")), "{:?}", names);
        // Each path appears once.
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), names.len());
    }

    #[test]
    fn test_digest_is_byproduct_of_write() {
        let tmp = TempDir::new().unwrap();
        let snapshot = snapshot_fixture(tmp.path());
        let archive_path = tmp.path().join("backup.tar.gz");

        let artifact = create_tar_gz_archive(&snapshot, &archive_path).unwrap();

        let mut bytes = Vec::new();
        File::open(&archive_path).unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(artifact.size_bytes, bytes.len() as u64);
        assert_eq!(artifact.md5, file_md5(&archive_path).unwrap());
    }

    #[test]
    fn test_missing_source_dir() {
        let tmp = TempDir::new().unwrap();
        let err = create_tar_gz_archive(&tmp.path().join("nope"), &tmp.path().join("a.tar.gz")).unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
        assert!(!tmp.path().join("a.tar.gz").exists());
    }

    #[test]
    fn test_refuses_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let snapshot = snapshot_fixture(tmp.path());
        let archive_path = tmp.path().join("backup.tar.gz");
        std::fs::write(&archive_path, b"old").unwrap();

        let err = create_tar_gz_archive(&snapshot, &archive_path).unwrap_err();
        assert_eq!(err.stage(), "archive");
    }
}
