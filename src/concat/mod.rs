//! Virtual-file materialization engine.
//!
//! A descriptor file lists byte-range references, one per line, in the form
//! `PATH[:START][:LENGTH]`. This module turns such a descriptor into a
//! fixed-size virtual file: [`spec`] validates single lines, [`file`] builds
//! the ordered chunk list and serves positioned reads across it, and
//! [`registry`] tracks open instances under concurrent access.

mod file;
mod registry;
mod spec;

pub use file::VirtualFile;
pub use registry::OpenFileRegistry;
pub use spec::RangeSpec;

use std::ffi::OsStr;

/// Default marker substring identifying descriptor files.
pub const DEFAULT_MARKER: &str = "-concat-";

/// A path names a descriptor file when its final segment contains the
/// marker anywhere in it. Only the file name is inspected, never the
/// directory components.
pub fn is_descriptor_name(name: &OsStr, marker: &str) -> bool {
    name.to_str().is_some_and(|name| name.contains(marker))
}
