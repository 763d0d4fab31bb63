//! concatfs: a FUSE passthrough filesystem with virtual concatenation files.
//!
//! The filesystem mirrors a source directory. Files whose name contains the
//! marker substring (`-concat-` by default) are descriptor files: each line
//! of their text content references a byte range of another file, in the
//! form `PATH[:START][:LENGTH]`, and the path is presented as a read-only
//! virtual file holding the concatenation of those ranges in line order.
//!
//! ```text
//! contents of bigmovie-concat-.MTS:
//!
//! file1.MTS
//! file2.MTS:1024
//! file3.MTS:0:4096
//! ```
//!
//! Empty lines and lines that do not resolve to a non-empty file are
//! ignored. Offsets and lengths are clamped to the referenced file's size.

#[macro_use]
extern crate log;

pub mod concat;
pub mod passthrough;
pub mod server;
