//! Shared test fixtures: a range-aware mock responder.

#![allow(dead_code)]

use wiremock::{Request, Respond, ResponseTemplate};

/// Serves a fixed body, honoring `Range: bytes=start-[end]` with 206
/// responses when range support is enabled and plain 200 otherwise.
pub struct RangeServer {
    body: Vec<u8>,
    support_ranges: bool,
}

impl RangeServer {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            support_ranges: true,
        }
    }

    /// A server that ignores Range headers and always sends the full body.
    pub fn without_range_support(body: Vec<u8>) -> Self {
        Self {
            body,
            support_ranges: false,
        }
    }
}

impl Respond for RangeServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) if self.support_ranges => {
                if start >= len {
                    return ResponseTemplate::new(416)
                        .insert_header("Content-Range", format!("bytes */{len}").as_str());
                }
                let end = end.unwrap_or(len - 1).min(len - 1);
                let slice = self.body[start as usize..=end as usize].to_vec();
                ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {start}-{end}/{len}").as_str(),
                    )
                    .insert_header("Accept-Ranges", "bytes")
                    .set_body_bytes(slice)
            }
            _ => ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", if self.support_ranges { "bytes" } else { "none" })
                .set_body_bytes(self.body.clone()),
        }
    }
}

/// Parses `bytes=start-[end]` into `(start, Option<end>)`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };
    Some((start, end))
}

/// A deterministic test body where every 4 KiB page carries its index, so
/// out-of-order merges are caught byte-for-byte.
pub fn patterned_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i / 4096) % 251) as u8 ^ (i as u8)).collect()
}
