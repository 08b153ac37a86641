//! Recursive directory copy for materialising and capturing layers.
//!
//! Files are reflinked when the filesystem supports it and copied
//! otherwise. Permissions, modification times, symlinks and hardlinks are
//! preserved; ownership is preserved when the process is allowed to chown.
//! A failed copy leaves the destination in an undefined partial state.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{lchown, symlink, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Errors produced by [`copy_dir`].
#[derive(Debug, Error)]
pub enum CopyError {
    /// The source tree could not be traversed.
    #[error("Failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),
    /// A filesystem operation on a single entry failed.
    #[error("Failed to copy '{path}': {source}")]
    Io {
        /// Path the operation failed on.
        path: PathBuf,
        /// Source error.
        #[source]
        source: io::Error,
    },
    /// The source is missing or not a directory.
    #[error("Copy source is not a directory: {0}")]
    NotADirectory(PathBuf),
    /// The destination lies inside the source tree.
    #[error("Copy destination '{dst}' is inside source '{src}'")]
    Overlap {
        /// Source directory.
        src: PathBuf,
        /// Destination directory.
        dst: PathBuf,
    },
    /// The copy was cancelled through its [`CancelToken`].
    #[error("Copy cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag shared between a caller and a running copy.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Copies observing this token stop at the next entry.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`CancelToken::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for a single [`copy_dir`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions<'a> {
    /// Flush every copied file and directory to stable storage.
    pub sync: bool,
    /// Checked before each entry; a cancelled token aborts the copy.
    pub cancel: Option<&'a CancelToken>,
}

/// Counters describing a finished copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Regular files copied or reflinked.
    pub files: u64,
    /// Directories created.
    pub directories: u64,
    /// Symlinks recreated.
    pub symlinks: u64,
    /// Hardlinks recreated against an already copied file.
    pub hardlinks: u64,
    /// Special files (sockets, fifos, devices) that were skipped.
    pub skipped: u64,
}

/// Recursively copies the contents of `src` into `dst`.
///
/// `dst` is created when missing. Existing entries in `dst` with the same
/// name as a source entry are replaced; other entries are left alone.
///
/// # Errors
///
/// Returns an error if `src` is not a directory, if `dst` lies inside
/// `src`, if the copy is cancelled, or if any filesystem operation fails.
pub fn copy_dir(src: &Path, dst: &Path, options: CopyOptions<'_>) -> Result<CopyStats, CopyError> {
    let src_meta = fs::metadata(src).map_err(io_at(src))?;
    if !src_meta.is_dir() {
        return Err(CopyError::NotADirectory(src.to_path_buf()));
    }

    fs::create_dir_all(dst).map_err(io_at(dst))?;
    let canonical_src = dunce::canonicalize(src).map_err(io_at(src))?;
    let canonical_dst = dunce::canonicalize(dst).map_err(io_at(dst))?;
    if canonical_dst.starts_with(&canonical_src) {
        return Err(CopyError::Overlap {
            src: canonical_src,
            dst: canonical_dst,
        });
    }

    let mut stats = CopyStats::default();
    // (dev, ino) of multiply-linked files -> first copy in dst
    let mut linked: HashMap<(u64, u64), PathBuf> = HashMap::new();
    // Directory metadata is applied after their contents are written.
    let mut directories: Vec<(PathBuf, fs::Metadata)> = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        if options.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(CopyError::Cancelled);
        }

        let entry = entry?;
        let path = entry.path();
        let Ok(relative_path) = path.strip_prefix(src) else {
            continue;
        };
        let target_path = dst.join(relative_path);
        let file_type = entry.file_type();
        let meta = entry.metadata()?;

        if file_type.is_dir() {
            if !relative_path.as_os_str().is_empty() {
                ensure_real_dir(&target_path)?;
                stats.directories += 1;
            }
            directories.push((target_path, meta));
        } else if file_type.is_symlink() {
            let link = fs::read_link(path).map_err(io_at(path))?;
            remove_existing(&target_path)?;
            symlink(&link, &target_path).map_err(io_at(&target_path))?;
            preserve_owner(&target_path, &meta);
            stats.symlinks += 1;
        } else if file_type.is_file() {
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = linked.get(&key) {
                    remove_existing(&target_path)?;
                    fs::hard_link(first, &target_path).map_err(io_at(&target_path))?;
                    stats.hardlinks += 1;
                    continue;
                }
                linked.insert(key, target_path.clone());
            }
            copy_file(path, &target_path, &meta, options.sync)?;
            stats.files += 1;
        } else {
            debug!("Skipping special file: {:?}", path);
            stats.skipped += 1;
        }
    }

    for (dir, meta) in directories.iter().rev() {
        apply_metadata(dir, meta, options.sync)?;
    }

    info!(
        files = stats.files,
        directories = stats.directories,
        "Directory copy complete: {:?} -> {:?}",
        src,
        dst
    );
    Ok(stats)
}

fn copy_file(src: &Path, dst: &Path, meta: &fs::Metadata, sync: bool) -> Result<(), CopyError> {
    remove_existing(dst)?;
    match reflink::reflink(src, dst) {
        Ok(()) => debug!("Reflinked: {:?} -> {:?}", src, dst),
        Err(e) => {
            debug!(
                "Reflink failed ({}), falling back to copy: {:?} -> {:?}",
                e, src, dst
            );
            fs::copy(src, dst).map_err(io_at(dst))?;
        }
    }
    apply_metadata(dst, meta, sync)
}

fn apply_metadata(path: &Path, meta: &fs::Metadata, sync: bool) -> Result<(), CopyError> {
    let handle = File::open(path).map_err(io_at(path))?;
    if let Ok(modified) = meta.modified() {
        handle.set_modified(modified).map_err(io_at(path))?;
    }
    if sync {
        handle.sync_all().map_err(io_at(path))?;
    }
    fs::set_permissions(path, meta.permissions()).map_err(io_at(path))?;
    preserve_owner(path, meta);
    Ok(())
}

/// Ownership is best effort: unprivileged processes keep their own uid/gid.
fn preserve_owner(path: &Path, meta: &fs::Metadata) {
    if let Err(e) = lchown(path, Some(meta.uid()), Some(meta.gid())) {
        debug!("Could not preserve owner of {:?}: {}", path, e);
    }
}

/// Makes `path` a real directory. A symlink or file already at `path` is
/// replaced, never followed.
fn ensure_real_dir(path: &Path) -> Result<(), CopyError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => remove_existing(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_at(path)(e)),
    }
    fs::create_dir(path).map_err(io_at(path))
}

fn remove_existing(path: &Path) -> Result<(), CopyError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(io_at(path)),
        Ok(_) => fs::remove_file(path).map_err(io_at(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_at(path)(e)),
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> CopyError + '_ {
    move |source| CopyError::Io {
        path: path.to_path_buf(),
        source,
    }
}
