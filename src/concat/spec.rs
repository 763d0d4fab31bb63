use std::fs;
use std::path::{Path, PathBuf};

/// One resolved descriptor line: a byte sub-range of an underlying file.
///
/// Produced transiently while scanning a descriptor; the range is already
/// clamped against the target file's size at resolution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    pub path: PathBuf,
    pub start: u64,
    pub length: u64,
}

impl RangeSpec {
    /// Parse one descriptor line of the form `PATH[:START][:LENGTH]`.
    ///
    /// Relative paths resolve against `base_dir` (the descriptor's own
    /// directory). Returns `None` for lines that contribute nothing: empty
    /// lines, targets that fail to stat, and zero-size targets. A missing or
    /// unparsable START defaults to 0; a missing or unparsable LENGTH
    /// defaults to the remaining bytes of the target. Both are clamped into
    /// the valid range of the target's actual size, never rejected.
    ///
    /// The first `:` always ends the path part, so a path containing `:`
    /// cannot be expressed. Known limitation of the line grammar.
    pub fn parse(line: &str, base_dir: &Path) -> Option<RangeSpec> {
        if line.is_empty() {
            return None;
        }

        let (raw_path, offsets) = match line.split_once(':') {
            Some((path, rest)) => (path, Some(rest)),
            None => (line, None),
        };
        if raw_path.is_empty() {
            return None;
        }

        let path = Path::new(raw_path);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        };

        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                debug!("skipping line {line:?}: stat failed: {err}");
                return None;
            }
        };
        if size == 0 {
            debug!("skipping line {line:?}: target is empty");
            return None;
        }

        let mut start = 0u64;
        let mut length = u64::MAX;
        if let Some(offsets) = offsets {
            let (first, second) = match offsets.split_once(':') {
                Some((first, second)) => (first, Some(second)),
                None => (offsets, None),
            };
            start = first.parse().unwrap_or(0);
            if let Some(second) = second {
                length = second.parse().unwrap_or(u64::MAX);
            }
        }

        let start = start.min(size - 1);
        let length = length.clamp(1, size - start);

        Some(RangeSpec {
            path,
            start,
            length,
        })
    }
}
