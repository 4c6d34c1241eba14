use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::roblox::MemberId;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("required file {} is missing", .0.display())]
    Missing(PathBuf),
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read the system clock")]
    Clock,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Checks that the snapshot and marker files exist, creating empty ones when
/// `create_missing` is set.
pub fn ensure_files(paths: &[&Path], create_missing: bool) -> Result<(), StorageError> {
    for path in paths {
        if path.is_file() {
            continue;
        }
        if !create_missing {
            return Err(StorageError::Missing(path.to_path_buf()));
        }
        warn!("File {} does not exist, creating an empty one.", path.display());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        File::create(path).map_err(io_error(path))?;
    }
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<HashSet<MemberId>, StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!("File {} does not exist, starting from an empty snapshot.", path.display());
            return Ok(HashSet::new());
        }
        Err(err) => return Err(io_error(path)(err)),
    };

    let mut ids = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_error(path))?;
        let id = line.trim();
        if !id.is_empty() {
            ids.insert(MemberId::new(id));
        }
    }
    Ok(ids)
}

/// Rewrites the snapshot wholesale. The new content goes to a sibling temp
/// file first so a crash never leaves a half-written snapshot behind.
pub fn write_snapshot(path: &Path, ids: &[MemberId]) -> Result<(), StorageError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = io::BufWriter::new(File::create(&tmp_path).map_err(io_error(&tmp_path))?);
    for id in ids {
        writeln!(file, "{id}").map_err(io_error(&tmp_path))?;
    }
    file.flush().map_err(io_error(&tmp_path))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(io_error(path))
}

/// Persists `current` only when it differs from `previous` as a set. Returns
/// whether a write happened.
pub fn update_snapshot(
    path: &Path,
    previous: &HashSet<MemberId>,
    current: &[MemberId],
) -> Result<bool, StorageError> {
    let unchanged = current.len() == previous.len() && current.iter().all(|id| previous.contains(id));
    if unchanged {
        info!("No changes detected, skipping update.");
        return Ok(false);
    }
    info!("Changes detected, updating local data file.");
    write_snapshot(path, current)?;
    Ok(true)
}

pub fn timestamp(format: &str) -> Result<String, StorageError> {
    let now = time_format::now().map_err(|_| StorageError::Clock)?;
    time_format::strftime_utc(format, now).map_err(|_| StorageError::Clock)
}

pub fn write_last_run(path: &Path) -> Result<(), StorageError> {
    let line = format!(
        "The last execution of the script: {} UTC\n",
        timestamp("%d.%m.%Y %H:%M:%S")?
    );
    fs::write(path, line).map_err(io_error(path))
}
