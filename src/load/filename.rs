//! Filename resolution for downloads.
//!
//! The resolution chain: caller-provided name, `Content-Disposition`
//! (`filename*` then `filename`), last URL path segment, basename of the
//! full URI, and finally `"requested_download"`. Extensionless names borrow
//! an extension from the response media type or the URL.

use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_TYPE};
use url::Url;

use crate::fsx;
use crate::http::header_str;

/// Fallback name when nothing else yields one.
pub(crate) const FALLBACK_FILE_NAME: &str = "requested_download";

/// Resolves the output filename from the response and URL.
pub(crate) fn resolve_file_name(
    user_name: Option<&str>,
    headers: &HeaderMap,
    url: &Url,
) -> String {
    let raw = user_name
        .map(str::to_string)
        .or_else(|| {
            header_str(headers, CONTENT_DISPOSITION.as_str()).and_then(parse_content_disposition)
        })
        .or_else(|| filename_from_url(url))
        .or_else(|| basename_of_uri(url))
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

    let mut name = fsx::sanitize_file_name(&raw);
    if name.is_empty() {
        name = FALLBACK_FILE_NAME.to_string();
    }

    if fsx::split_name(&name).1.is_empty() {
        let extension = header_str(headers, CONTENT_TYPE.as_str())
            .and_then(fsx::extension_from_media_type)
            .map(str::to_string)
            .or_else(|| extension_from_url(url));
        if let Some(extension) = extension {
            name.push_str(&extension);
        }
    }
    name
}

/// Parses a `Content-Disposition` header value into a filename.
///
/// Handles `filename*=UTF-8''encoded` (RFC 5987), `filename="quoted"`, and
/// bare `filename=value`.
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    // RFC 5987 encoded form wins over the plain parameter.
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + "filename*=".len()..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim();
            if let Ok(decoded) = urlencoding::decode(encoded_name) {
                let decoded = decoded.trim();
                if !decoded.is_empty() {
                    return Some(decoded.to_string());
                }
            }
        }
    }

    let pos = header.find("filename=")?;
    let value = header[pos + "filename=".len()..].trim();
    let name = if let Some(stripped) = value.strip_prefix('"') {
        stripped.split('"').next()?
    } else {
        value.split(';').next()?.trim()
    };
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Last non-empty URL path segment, percent-decoded.
pub(crate) fn filename_from_url(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    let last = segments.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.to_string());
    (!decoded.is_empty()).then_some(decoded)
}

/// Basename of the full URI string (text after the final slash).
pub(crate) fn basename_of_uri(url: &Url) -> Option<String> {
    let text = url.as_str().trim_end_matches('/');
    let base = text.rsplit('/').next()?;
    (!base.is_empty()).then(|| base.to_string())
}

/// Extension (with dot) of the URL's last path segment.
pub(crate) fn extension_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let dot = last.rfind('.')?;
    let extension = &last[dot..];
    if extension.len() <= 1 || extension.len() > 12 {
        return None;
    }
    Some(extension.to_lowercase())
}
