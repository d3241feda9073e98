//! Snapshot archiver: serializes a directory tree into a gzip-compressed tar
//! archive and restores it.
//!
//! Only directories and regular files are captured.  Symlinks, devices,
//! sockets and FIFOs are skipped.  File contents are streamed, never
//! buffered whole.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Component, Path};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Mode given to directories restored from an archive.
const RESTORED_DIR_MODE: u32 = 0o755;

/// What a call to [`create_snapshot`] captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Regular files written.
    pub files: u64,
    /// Sum of regular file sizes, i.e. the restore size.
    pub bytes: u64,
}

/// Archive every regular file below `source_dir` into `archive_out`.
///
/// The archive is written directly to `archive_out` (its parent directory is
/// created if needed).  A partial archive is removed when archiving fails.
pub fn create_snapshot(source_dir: &Path, archive_out: &Path) -> io::Result<ArchiveSummary> {
    let meta = fs::metadata(source_dir)?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", source_dir.display()),
        ));
    }
    if let Some(parent) = archive_out.parent() {
        fs::create_dir_all(parent)?;
    }

    let result = write_archive(source_dir, archive_out);
    if result.is_err()
        && let Err(e) = fs::remove_file(archive_out)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(archive = %archive_out.display(), error = %e, "failed to remove partial archive");
    }
    let summary = result?;
    info!(
        source = %source_dir.display(),
        archive = %archive_out.display(),
        files = summary.files,
        bytes = summary.bytes,
        "snapshot archive written",
    );
    Ok(summary)
}

fn write_archive(source_dir: &Path, archive_out: &Path) -> io::Result<ArchiveSummary> {
    let file = File::create(archive_out)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    let mut summary = ArchiveSummary::default();

    let walker = WalkDir::new(source_dir)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1);
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        // Never archive the archive itself when it lives inside the tree.
        if path == archive_out {
            continue;
        }
        let rel = path
            .strip_prefix(source_dir)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let file_type = entry.file_type();
        let meta = entry.metadata()?;

        let mut header = Header::new_gnu();
        header.set_mode(meta.mode() & 0o7777);
        header.set_mtime(u64::try_from(meta.mtime()).unwrap_or_default());

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, rel, io::empty())?;
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let mut reader = ExactLen::new(BufReader::new(File::open(path)?), meta.len());
            builder.append_data(&mut header, rel, &mut reader)?;
            if reader.padded > 0 {
                warn!(
                    path = %path.display(),
                    missing = reader.padded,
                    "file shrank while archiving; zero-filled to its recorded size",
                );
            }
            summary.files += 1;
            summary.bytes += meta.len();
        } else {
            debug!(path = %path.display(), "skipping non-regular file");
        }
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(summary)
}

/// Yields exactly `len` bytes of `inner`.  A file that grows while it is
/// archived is cut at the size written to its tar header; one that shrinks is
/// padded with zeros, so the entry always matches its header.
struct ExactLen<R> {
    inner: R,
    remaining: u64,
    padded: u64,
}

impl<R: Read> ExactLen<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
            padded: 0,
        }
    }
}

impl<R: Read> Read for ExactLen<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let mut n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            buf[..want].fill(0);
            n = want;
            self.padded += want as u64;
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Restore `archive_in` into `target_dir`, creating it if absent.
///
/// Existing directories are reused; existing files are replaced.
pub fn extract_snapshot(archive_in: &Path, target_dir: &Path) -> io::Result<ArchiveSummary> {
    fs::create_dir_all(target_dir)?;
    let file = File::open(archive_in)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut summary = ArchiveSummary::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        if !is_safe_relative(&rel) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive entry escapes target: {}", rel.display()),
            ));
        }
        let target = target_dir.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                if !target.is_dir() {
                    fs::DirBuilder::new()
                        .recursive(true)
                        .mode(RESTORED_DIR_MODE)
                        .create(&target)?;
                }
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent()
                    && !parent.is_dir()
                {
                    fs::DirBuilder::new()
                        .recursive(true)
                        .mode(RESTORED_DIR_MODE)
                        .create(parent)?;
                }
                let mode = entry.header().mode().unwrap_or(0o644);
                match fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                let mut out = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(mode)
                    .open(&target)?;
                let written = io::copy(&mut entry, &mut out)?;
                summary.files += 1;
                summary.bytes += written;
            }
            other => {
                debug!(path = %rel.display(), entry_type = ?other, "skipping unsupported archive entry");
            }
        }
    }

    info!(
        archive = %archive_in.display(),
        target = %target_dir.display(),
        files = summary.files,
        "snapshot archive extracted",
    );
    Ok(summary)
}

/// Remove the archive at `archive_path`; absence is success.
pub fn delete_snapshot(archive_path: &Path) -> io::Result<()> {
    match fs::remove_file(archive_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
