use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

const MTIME_TOLERANCE: Duration = Duration::from_secs(5);
const MAX_SWAP_RETRIES: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(300);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// True when two files are "the same snapshot" for the purposes of
/// skipping a refresh: equal size and modification times within a 5
/// second tolerance (§4.2, clock granularity differences across
/// filesystems/network shares).
pub fn files_are_equivalent(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = fs::metadata(a)?;
    let meta_b = fs::metadata(b)?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    let mtime_a = meta_a.modified()?;
    let mtime_b = meta_b.modified()?;
    let delta = if mtime_a > mtime_b {
        mtime_a.duration_since(mtime_b).unwrap_or_default()
    } else {
        mtime_b.duration_since(mtime_a).unwrap_or_default()
    };
    Ok(delta <= MTIME_TOLERANCE)
}

/// Extracts the database file worth of a DWINGS snapshot archive:
/// whichever `.accdb`/`.db` entry is explicitly named `DW_Data`, falling
/// back to the largest database-shaped entry in the archive (§4.2).
pub fn extract_snapshot_database(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let file = fs::File::open(archive_path)?;
    let mut zip = zip::ZipArchive::new(file)?;

    let mut best_index: Option<usize> = None;
    let mut best_size: u64 = 0;
    let mut named_index: Option<usize> = None;

    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        if !is_database_entry(&name) {
            continue;
        }
        let stem = Path::new(&name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if stem.eq_ignore_ascii_case("DW_Data") {
            named_index = Some(i);
        }
        if entry.size() > best_size {
            best_size = entry.size();
            best_index = Some(i);
        }
    }

    let index = named_index.or(best_index).ok_or_else(|| {
        SyncError::Fatal(format!("no database entry found in {}", archive_path.display()))
    })?;

    let mut entry = zip.by_index(index)?;
    let dest_name = Path::new(entry.name())
        .file_name()
        .ok_or_else(|| SyncError::Fatal("archive entry has no file name".into()))?;
    let dest_path = dest_dir.join(dest_name);
    fs::create_dir_all(dest_dir)?;
    let mut out = fs::File::create(&dest_path)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    out.write_all_or_io(&buf)?;
    Ok(dest_path)
}

fn is_database_entry(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".accdb") || lower.ends_with(".db")
}

trait WriteAllOrIo {
    fn write_all_or_io(&mut self, buf: &[u8]) -> Result<()>;
}

impl WriteAllOrIo for fs::File {
    fn write_all_or_io(&mut self, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        self.write_all(buf)?;
        Ok(())
    }
}

/// Atomically swaps `new_path` into `target_path`, retrying a handful of
/// times with exponential backoff on sharing violations before falling
/// back to delete-then-move (§4.2 "5 retries, 300ms -> 5s backoff, then
/// delete+move fallback").
pub fn atomic_swap(new_path: &Path, target_path: &Path) -> Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = None;
    for attempt in 0..MAX_SWAP_RETRIES {
        match fs::rename(new_path, target_path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < MAX_SWAP_RETRIES {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
    // Fallback: delete the existing target then move the new file in.
    if target_path.exists() {
        fs::remove_file(target_path)?;
    }
    fs::rename(new_path, target_path).map_err(|e| {
        SyncError::Transient(format!(
            "swap into {} failed after retries: {} (last rename error: {:?})",
            target_path.display(),
            e,
            last_err
        ))
    })
}

/// Waits for a freshly extracted file's mtime to stop changing, guarding
/// against network-share write buffering before the swap is attempted
/// (§4.2 "mtime stabilization after extraction").
pub fn wait_for_mtime_stable(path: &Path, poll: Duration, max_wait: Duration) -> Result<()> {
    let start = std::time::Instant::now();
    let mut last_mtime = fs::metadata(path)?.modified()?;
    loop {
        std::thread::sleep(poll);
        let current = fs::metadata(path)?.modified()?;
        if current == last_mtime {
            return Ok(());
        }
        last_mtime = current;
        if start.elapsed() >= max_wait {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn equivalent_files_match_on_size_and_mtime_tolerance() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        fs::write(&a, b"same-bytes").unwrap();
        fs::write(&b, b"same-bytes").unwrap();
        assert!(files_are_equivalent(&a, &b).unwrap());
    }

    #[test]
    fn different_sizes_are_not_equivalent() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        fs::write(&a, b"short").unwrap();
        fs::write(&b, b"a much longer payload").unwrap();
        assert!(!files_are_equivalent(&a, &b).unwrap());
    }

    #[test]
    fn extracts_named_db_entry_from_zip() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("DW_Data.zip");
        let file = fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let opts = zip::write::FileOptions::default();
        writer.start_file("README.txt", opts).unwrap();
        writer.write_all(b"not a database").unwrap();
        writer.start_file("DW_Data.db", opts).unwrap();
        writer.write_all(b"binary-db-contents").unwrap();
        writer.finish().unwrap();

        let dest_dir = dir.path().join("out");
        let extracted = extract_snapshot_database(&archive_path, &dest_dir).unwrap();
        assert_eq!(extracted.file_name().unwrap(), "DW_Data.db");
        assert_eq!(fs::read(&extracted).unwrap(), b"binary-db-contents");
    }

    #[test]
    fn atomic_swap_moves_file_into_place() {
        let dir = tempdir().unwrap();
        let new_path = dir.path().join("incoming.db");
        let target_path = dir.path().join("Control.db");
        fs::write(&new_path, b"fresh snapshot").unwrap();
        fs::write(&target_path, b"stale snapshot").unwrap();
        atomic_swap(&new_path, &target_path).unwrap();
        assert_eq!(fs::read(&target_path).unwrap(), b"fresh snapshot");
        assert!(!new_path.exists());
    }
}
