//! Static shells and slot placeholder positions.
//!
//! A shell is rendered once in [`RenderMode::ShellBuild`](super::RenderMode)
//! mode, where every slot region is emitted as [`slot_marker`]. Marker
//! positions are located once when the shell is built and kept alongside the
//! bytes, so per-request assembly walks a segment list instead of re-scanning
//! the document.

use std::sync::Arc;

use bytes::Bytes;

const MARKER_OPEN: &[u8] = b"<!--slot:";
const MARKER_CLOSE: &[u8] = b"-->";

/// Placeholder a renderer must emit for `name` in shell-build mode.
pub fn slot_marker(name: &str) -> String {
    format!("<!--slot:{name}-->")
}

/// Inline fragment substituted when a slot renderer fails.
pub fn slot_fallback(name: &str) -> Bytes {
    Bytes::from(format!("<!--slot:{name} unavailable-->"))
}

/// One piece of a shell in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Static(Bytes),
    Slot(String),
}

/// Cached shell bytes plus their pre-computed segments.
#[derive(Debug, Clone)]
pub struct ShellEntry {
    bytes: Bytes,
    segments: Arc<[Segment]>,
}

impl ShellEntry {
    /// Split rendered shell bytes into static runs and slot placeholders.
    pub fn parse(bytes: Bytes) -> Self {
        let mut segments = Vec::new();
        let mut cursor = 0;
        let mut scan_from = 0;

        while let Some(open) = find(&bytes[scan_from..], MARKER_OPEN).map(|at| at + scan_from) {
            let name_start = open + MARKER_OPEN.len();
            let Some(close) = find(&bytes[name_start..], MARKER_CLOSE).map(|at| at + name_start)
            else {
                break;
            };

            match slot_name(&bytes[name_start..close]) {
                Some(name) => {
                    if open > cursor {
                        segments.push(Segment::Static(bytes.slice(cursor..open)));
                    }
                    segments.push(Segment::Slot(name));
                    cursor = close + MARKER_CLOSE.len();
                    scan_from = cursor;
                }
                // Ordinary comment that happens to start like a marker.
                None => scan_from = name_start,
            }
        }

        if cursor < bytes.len() {
            segments.push(Segment::Static(bytes.slice(cursor..)));
        }

        Self {
            bytes,
            segments: segments.into(),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Slot names in document order.
    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Slot(name) => Some(name.as_str()),
            Segment::Static(_) => None,
        })
    }

    /// Declared slots the renderer did not emit a marker for.
    pub fn missing_slots<'a>(&self, declared: &'a [String]) -> Vec<&'a str> {
        declared
            .iter()
            .map(String::as_str)
            .filter(|name| !self.slot_names().any(|found| found == *name))
            .collect()
    }
}

fn slot_name(raw: &[u8]) -> Option<String> {
    let name = std::str::from_utf8(raw).ok()?;
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    valid.then(|| name.to_string())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
