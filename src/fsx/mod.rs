//! Filesystem adapter: the small set of file capabilities the engine needs.
//!
//! Everything here is a thin boundary over `tokio::fs`/`std::fs` plus the
//! platform lookups (download folder, MIME → extension) that may be absent
//! on some systems.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tracing::debug;

use crate::error::DownloadError;

/// Characters never allowed in a filename on the supported platforms.
const INVALID_FILENAME_CHARS: &[char] =
    &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// Creates (or truncates) the file at `path`.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] on filesystem failure.
pub async fn create_truncate(path: &Path) -> Result<File, DownloadError> {
    File::create(path)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

/// Opens `path` for appending, creating it when absent.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] on filesystem failure.
pub async fn open_append(path: &Path) -> Result<File, DownloadError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

/// Opens `path` for reading.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] on filesystem failure.
pub async fn open_read(path: &Path) -> Result<File, DownloadError> {
    File::open(path).await.map_err(|e| DownloadError::io(path, e))
}

/// Length of the file at `path`, or `None` when it does not exist.
pub async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|meta| meta.len())
}

/// Moves `src` over `dst`, overwriting an existing destination.
///
/// Uses `rename` for the atomic same-filesystem case and falls back to
/// copy + delete across mount points.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] on filesystem failure.
pub async fn atomic_move(src: &Path, dst: &Path) -> Result<(), DownloadError> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %rename_err,
                "rename failed, falling back to copy"
            );
            tokio::fs::copy(src, dst)
                .await
                .map_err(|e| DownloadError::io(dst, e))?;
            tokio::fs::remove_file(src)
                .await
                .map_err(|e| DownloadError::io(src, e))
        }
    }
}

/// Deletes `path`, ignoring a missing file.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] for failures other than `NotFound`.
pub async fn remove_if_exists(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

/// Creates `dir` and its parents when missing, validating the result is a
/// usable directory path.
///
/// # Errors
///
/// [`DownloadError::InvalidPath`] for an empty path, [`DownloadError::Io`]
/// on filesystem failure.
pub fn ensure_dir(dir: &Path) -> Result<(), DownloadError> {
    if dir.as_os_str().is_empty() {
        return Err(DownloadError::InvalidPath {
            path: dir.to_path_buf(),
        });
    }
    std::fs::create_dir_all(dir).map_err(|e| DownloadError::io(dir, e))
}

/// Removes invalid filename characters and trims separator clutter.
///
/// Produces a name safe on every supported platform; an input with nothing
/// usable collapses to the empty string (callers substitute a fallback).
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if INVALID_FILENAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    cleaned.trim().trim_matches('.').trim().to_string()
}

/// Resolves a non-colliding path `dir/name`, appending ` (i)` before the
/// extension while a file with the candidate name exists.
#[must_use]
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, extension) = split_name(name);
    for i in 1.. {
        let numbered = format!("{stem}({i}){extension}");
        let candidate = dir.join(&numbered);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("unbounded suffix search")
}

/// Splits `name` into (stem, extension-with-dot).
#[must_use]
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => name.split_at(idx),
    }
}

/// Validates that `path` is absolute.
///
/// # Errors
///
/// [`DownloadError::InvalidPath`] for relative or empty paths.
pub fn validate_absolute(path: &Path) -> Result<(), DownloadError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(DownloadError::InvalidPath {
            path: path.to_path_buf(),
        })
    }
}

/// The platform download folder, when discoverable.
#[must_use]
pub fn download_dir() -> Option<PathBuf> {
    dirs::download_dir()
}

/// Guesses a file extension (with dot) from a MIME media type.
///
/// Returns `None` for unknown types; callers fall back to the URL
/// extension.
#[must_use]
pub fn extension_from_media_type(media_type: &str) -> Option<&'static str> {
    let mime = media_type.split(';').next().unwrap_or("").trim();
    let ext = match mime.to_ascii_lowercase().as_str() {
        "text/html" => ".html",
        "text/plain" => ".txt",
        "text/css" => ".css",
        "text/csv" => ".csv",
        "text/javascript" | "application/javascript" => ".js",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/gzip" => ".gz",
        "application/x-tar" => ".tar",
        "application/octet-stream" => ".bin",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "audio/mpeg" => ".mp3",
        "audio/ogg" => ".ogg",
        "audio/wav" => ".wav",
        _ => return None,
    };
    Some(ext)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_file_name("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_file_name("  report.pdf  "), "report.pdf");
        assert_eq!(sanitize_file_name("..."), "");
    }

    #[test]
    fn test_split_name_variants() {
        assert_eq!(split_name("file.tar.gz"), ("file.tar", ".gz"));
        assert_eq!(split_name("noext"), ("noext", ""));
        assert_eq!(split_name(".hidden"), (".hidden", ""));
    }

    #[test]
    fn test_unique_path_appends_counter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("data(1).bin"), b"x").unwrap();

        let resolved = unique_path(dir.path(), "data.bin");
        assert_eq!(resolved, dir.path().join("data(2).bin"));
    }

    #[test]
    fn test_unique_path_returns_original_when_free() {
        let dir = TempDir::new().unwrap();
        let resolved = unique_path(dir.path(), "fresh.bin");
        assert_eq!(resolved, dir.path().join("fresh.bin"));
    }

    #[test]
    fn test_validate_absolute() {
        assert!(validate_absolute(Path::new("/tmp/out.bin")).is_ok());
        assert!(matches!(
            validate_absolute(Path::new("relative/out.bin")),
            Err(DownloadError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_extension_from_media_type() {
        assert_eq!(extension_from_media_type("application/pdf"), Some(".pdf"));
        assert_eq!(
            extension_from_media_type("text/html; charset=utf-8"),
            Some(".html")
        );
        assert_eq!(extension_from_media_type("application/x-unknown"), None);
    }

    #[tokio::test]
    async fn test_atomic_move_overwrites_destination() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("part.bin");
        let dst = dir.path().join("final.bin");
        tokio::fs::write(&src, b"new contents").await.unwrap();
        tokio::fs::write(&dst, b"old").await.unwrap();

        atomic_move(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"new contents");
    }

    #[tokio::test]
    async fn test_file_len_and_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.bin");
        assert_eq!(file_len(&path).await, None);
        tokio::fs::write(&path, b"12345").await.unwrap();
        assert_eq!(file_len(&path).await, Some(5));

        remove_if_exists(&path).await.unwrap();
        remove_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }
}
