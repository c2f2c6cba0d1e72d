use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Writes `bytes` next to `path` under a temporary name, then swaps it in.
/// Readers never observe a half-written blueprint or save file.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let staging = staging_path(path);
    if let Err(error) = fs::write(&staging, bytes) {
        let _ = fs::remove_file(&staging);
        return Err(error);
    }
    swap_into_place(&staging, path)
}

pub(crate) fn write_text_atomic(path: &Path, text: &str) -> io::Result<()> {
    write_bytes_atomic(path, text.as_bytes())
}

fn swap_into_place(staging: &Path, target: &Path) -> io::Result<()> {
    // rename() does not replace an existing file on every platform.
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            let _ = fs::remove_file(staging);
            return Err(error);
        }
    }

    fs::rename(staging, target).map_err(|error| {
        let _ = fs::remove_file(staging);
        error
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("construction");
    path.with_file_name(format!(".{file_name}.{}.partial", std::process::id()))
}
