use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// Computes a SHA-256 digest over a directory tree: entry paths, kinds,
/// permission bits, symlink targets and file contents.
///
/// Modification times and ownership are not part of the digest, so two
/// trees with identical content and layout hash the same after a copy.
pub fn compute_directory_hash(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut count: u64 = 0;

    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let entry_path = entry.path();
        let relative = entry_path
            .strip_prefix(path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let meta = entry.metadata()?;
        hasher.update(relative.as_os_str().as_bytes());
        hasher.update([0]);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"d");
        } else if file_type.is_symlink() {
            hasher.update(b"l");
            hasher.update(fs::read_link(entry_path)?.as_os_str().as_bytes());
        } else if file_type.is_file() {
            hasher.update(b"f");
            let mut file = fs::File::open(entry_path)?;
            let mut buffer = [0u8; 8192];
            loop {
                let bytes_read = file.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                hasher.update(&buffer[..bytes_read]);
            }
        } else {
            hasher.update(b"s");
        }

        if !file_type.is_symlink() {
            hasher.update((meta.permissions().mode() & 0o7777).to_le_bytes());
        }
        count += 1;
    }

    // Entry count guards against deletions that would otherwise collide.
    hasher.update(count.to_le_bytes());
    Ok(hex::encode(hasher.finalize()))
}
