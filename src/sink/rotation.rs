use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

fn numbered(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Open `path` for appending, rotating it first when it has grown past
/// `max_size` bytes.
///
/// Rotation shifts `file.N` to `file.N+1` (the oldest beyond `keep` is
/// removed) and moves the live file to `file.1`. With `keep == 0` the old
/// file is simply removed.
pub fn open_rotating(path: &Path, max_size: u64, keep: usize) -> io::Result<File> {
    let needs_rotation = std::fs::metadata(path).is_ok_and(|meta| meta.len() > max_size);

    if needs_rotation {
        debug!(path = %path.display(), "rotating log file");
        rotate(path, keep)?;
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    OpenOptions::new().create(true).append(true).open(path)
}

/// Append-only log file that rotates itself once a write would push it past
/// `max_size`.
pub struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    keep: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_size: u64, keep: usize) -> io::Result<Self> {
        let path = path.into();
        let file = open_rotating(&path, max_size, keep)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_size,
            keep,
            file,
            written,
        })
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.file.flush()?;
            rotate(&self.path, self.keep)?;
            self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn rotate(path: &Path, keep: usize) -> io::Result<()> {
    if keep == 0 {
        return std::fs::remove_file(path);
    }

    let oldest = numbered(path, keep);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }

    for n in (1..keep).rev() {
        let from = numbered(path, n);
        if from.exists() {
            std::fs::rename(&from, numbered(path, n + 1))?;
        }
    }

    std::fs::rename(path, numbered(path, 1))
}
