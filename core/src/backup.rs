use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("cannot write {0}: target has no parent directory")]
    NoParent(PathBuf),
}

/// Writes `contents` next to `target`, syncs it, then renames it over `target`.
///
/// Readers see either the previous file or the new one, never a partial write.
pub fn swap_in(target: &Path, contents: &[u8]) -> Result<(), BackupError> {
    let parent = target
        .parent()
        .ok_or_else(|| BackupError::NoParent(target.to_path_buf()))?;
    fs::create_dir_all(parent)?;

    let temp_path = build_temp_path(target);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    #[cfg(target_os = "windows")]
    {
        use std::io::ErrorKind;
        if let Err(err) = fs::rename(&temp_path, target) {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(target)?;
                fs::rename(&temp_path, target)?;
            } else {
                let _ = fs::remove_file(&temp_path);
                return Err(BackupError::Io(err));
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Err(err) = fs::rename(&temp_path, target) {
            let _ = fs::remove_file(&temp_path);
            return Err(BackupError::Io(err));
        }
    }

    Ok(())
}

/// Moves an unreadable file aside as `<name>.corrupted.<timestamp>.bak`.
pub fn quarantine(path: &Path) -> Result<PathBuf, BackupError> {
    let timestamp = Local::now().format("%Y%m%d%H%M%S");
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupted.{timestamp}.bak"));

    let mut candidate = path.with_file_name(&name);
    let mut attempt = 1;
    while candidate.exists() {
        let mut numbered = name.clone();
        numbered.push(format!(".{attempt}"));
        candidate = path.with_file_name(numbered);
        attempt += 1;
    }

    fs::rename(path, &candidate)?;
    Ok(candidate)
}

fn build_temp_path(target: &Path) -> PathBuf {
    let mut temp = target.to_path_buf();
    let pid = std::process::id();
    let suffix = format!("__tmp__pid_{}", pid);
    match temp.file_name() {
        Some(name) => {
            let mut os_string = name.to_os_string();
            os_string.push(suffix);
            temp.set_file_name(os_string);
        }
        None => {
            temp.push(format!("temp_{pid}"));
        }
    }
    temp
}
