use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::spec::RangeSpec;

/// One resolved byte range contributing to a virtual file, holding its own
/// read-only handle to the underlying file. The handle is released when the
/// chunk is dropped.
#[derive(Debug)]
pub struct Chunk {
    file: File,
    start: u64,
    len: u64,
}

/// A materialized descriptor file: the ordered chunk sequence and the total
/// virtual size. Holds the handle under which the descriptor itself was
/// opened (full materialization only) so the descriptor stays alive for as
/// long as the virtual file does; every handle is released on drop.
#[derive(Debug)]
pub struct VirtualFile {
    _descriptor: Option<File>,
    chunks: Vec<Chunk>,
    size: u64,
}

impl VirtualFile {
    /// Fully materialize a descriptor that was just opened under `descriptor`.
    ///
    /// Each resolvable line is opened read-only and becomes a chunk, in line
    /// order. A referenced file that resolved but then fails to open (the
    /// stat/open race) fails the whole call rather than leaving a dead chunk
    /// behind; unresolvable lines are skipped as usual.
    pub fn open(path: &Path, descriptor: File) -> io::Result<VirtualFile> {
        let (chunks, size) = scan(path, BufReader::new(&descriptor), true)?;
        Ok(VirtualFile {
            _descriptor: Some(descriptor),
            chunks,
            size,
        })
    }

    /// Compute the virtual size of a descriptor without opening any of the
    /// referenced files. Used for attribute queries; an unreadable
    /// descriptor simply reports size 0.
    pub fn probe_size(path: &Path) -> u64 {
        let Ok(descriptor) = File::open(path) else {
            return 0;
        };
        match scan(path, BufReader::new(descriptor), false) {
            Ok((_, size)) => size,
            // materialize=false opens nothing, so scan cannot fail; keep the
            // attribute path total just in case.
            Err(_) => 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Serve a positioned read against the chunk sequence.
    ///
    /// Reads past the end return 0. A read spanning several chunks issues
    /// one positioned read per chunk; a short read from the underlying file
    /// returns the bytes accumulated so far without retrying, and an I/O
    /// error aborts the whole call.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        // Locate the chunk covering the first requested byte.
        let mut local = offset;
        let mut idx = 0;
        while idx < self.chunks.len() && local >= self.chunks[idx].len {
            local -= self.chunks[idx].len;
            idx += 1;
        }

        let mut filled = 0usize;

        // Chunks whose remainder is fully consumed by the request.
        while idx < self.chunks.len() && (buf.len() - filled) as u64 > self.chunks[idx].len - local
        {
            let chunk = &self.chunks[idx];
            let want = (chunk.len - local) as usize;
            let n = chunk
                .file
                .read_at(&mut buf[filled..filled + want], chunk.start + local)?;
            filled += n;
            if n < want {
                return Ok(filled);
            }
            local = 0;
            idx += 1;
        }

        // Trailing chunk covering the rest of the request, if any.
        if idx < self.chunks.len() {
            let chunk = &self.chunks[idx];
            filled += chunk.file.read_at(&mut buf[filled..], chunk.start + local)?;
        }

        Ok(filled)
    }
}

/// Scan a descriptor line by line, resolving each range spec in order.
/// Returns the accumulated chunk list (empty unless `materialize`) and the
/// total virtual size.
fn scan<R: BufRead>(path: &Path, reader: R, materialize: bool) -> io::Result<(Vec<Chunk>, u64)> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("/"));

    let mut chunks = Vec::new();
    let mut size = 0u64;
    for line in reader.lines() {
        let line = line?;
        let Some(spec) = RangeSpec::parse(&line, base_dir) else {
            continue;
        };
        size += spec.length;
        if materialize {
            let file = File::open(&spec.path)?;
            chunks.push(Chunk {
                file,
                start: spec.start,
                len: spec.length,
            });
        }
    }
    Ok((chunks, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, data: &[u8]) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(data).unwrap();
    }

    fn write_descriptor(dir: &Path, lines: &str) -> std::path::PathBuf {
        let path = dir.join("movie-concat-.bin");
        fs::write(&path, lines).unwrap();
        path
    }

    fn open_virtual(path: &Path) -> VirtualFile {
        let descriptor = File::open(path).unwrap();
        VirtualFile::open(path, descriptor).unwrap()
    }

    fn tree() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.bin", b"0123456789");
        write_file(dir.path(), "b.bin", b"abcdef");
        let desc = write_descriptor(dir.path(), "a.bin:5:3\nb.bin::1\nb.bin:2\n");
        (dir, desc)
    }

    #[test]
    fn full_read_is_the_concatenation_in_line_order() {
        let (_dir, desc) = tree();
        let vf = open_virtual(&desc);
        assert_eq!(vf.size(), 3 + 1 + 4);

        let mut buf = vec![0u8; vf.size() as usize];
        let n = vf.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(&buf, b"567acdef");
    }

    #[test]
    fn probe_size_matches_materialized_size() {
        let (_dir, desc) = tree();
        let vf = open_virtual(&desc);
        assert_eq!(VirtualFile::probe_size(&desc), vf.size());
    }

    #[test]
    fn sub_ranges_reassemble_to_the_full_read() {
        let (_dir, desc) = tree();
        let vf = open_virtual(&desc);

        let mut full = vec![0u8; vf.size() as usize];
        vf.read_at(&mut full, 0).unwrap();

        for window in 1..=full.len() {
            let mut assembled = Vec::new();
            let mut offset = 0u64;
            loop {
                let mut buf = vec![0u8; window];
                let n = vf.read_at(&mut buf, offset).unwrap();
                if n == 0 {
                    break;
                }
                assembled.extend_from_slice(&buf[..n]);
                offset += n as u64;
            }
            assert_eq!(assembled, full, "window {window}");
        }
    }

    #[test]
    fn read_past_the_end_is_clean_eof() {
        let (_dir, desc) = tree();
        let vf = open_virtual(&desc);
        let mut buf = [0u8; 4];
        assert_eq!(vf.read_at(&mut buf, vf.size()).unwrap(), 0);
        assert_eq!(vf.read_at(&mut buf, vf.size() + 100).unwrap(), 0);
    }

    #[test]
    fn read_straddling_the_tail_is_truncated() {
        let (_dir, desc) = tree();
        let vf = open_virtual(&desc);
        let mut buf = [0u8; 16];
        let n = vf.read_at(&mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[test]
    fn zero_length_read_touches_nothing() {
        let (_dir, desc) = tree();
        let vf = open_virtual(&desc);
        assert_eq!(vf.read_at(&mut [], 0).unwrap(), 0);
    }

    #[test]
    fn unresolvable_lines_only_shrink_the_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.bin", b"0123456789");
        let desc = write_descriptor(dir.path(), "missing.bin\na.bin:5:3\n\na.bin:9\n");
        let vf = open_virtual(&desc);
        assert_eq!(vf.size(), 4);

        let mut buf = vec![0u8; 4];
        vf.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"5679");
    }

    #[test]
    fn open_fails_eagerly_when_a_referenced_file_cannot_be_opened() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.bin", b"0123456789");
        write_file(dir.path(), "locked.bin", b"abcdef");
        fs::set_permissions(
            dir.path().join("locked.bin"),
            fs::Permissions::from_mode(0o000),
        )
        .unwrap();
        let desc = write_descriptor(dir.path(), "missing.bin\na.bin:5:3\nlocked.bin\n");

        // Size probing opens nothing: the unreadable target still stats fine
        // and counts in full, while the missing one is skipped.
        assert_eq!(VirtualFile::probe_size(&desc), 3 + 6);

        // Materialization opens every resolved line and must surface the
        // failure at open time rather than hand back a dead chunk.
        let err = VirtualFile::open(&desc, File::open(&desc).unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn descriptor_with_no_valid_lines_presents_empty() {
        let dir = tempfile::tempdir().unwrap();
        let desc = write_descriptor(dir.path(), "missing.bin\n\n");
        let vf = open_virtual(&desc);
        assert_eq!(vf.size(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(vf.read_at(&mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn unreadable_descriptor_probes_as_empty() {
        assert_eq!(VirtualFile::probe_size(Path::new("/nonexistent/desc")), 0);
    }
}
