//! File-backed frame producer and sink used by the command-line driver

use crate::stream::FrameSink;
use anyhow::{Context, Result, anyhow};
use protocol::{Frame, SequenceCounter};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Cycles through the files of a directory, one frame per file
#[derive(Debug)]
pub struct FileProducer {
    files: Vec<PathBuf>,
    next: usize,
    sequence: SequenceCounter,
    max_frame_bytes: usize,
}

impl FileProducer {
    /// Collect the regular files of `dir` in name order
    pub fn open(dir: &Path, max_frame_bytes: usize) -> Result<Self> {
        let mut files = fs::read_dir(dir)
            .with_context(|| format!("Failed to read input directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        files.sort();

        if files.is_empty() {
            return Err(anyhow!("No input files in {}", dir.display()));
        }

        Ok(Self {
            files,
            next: 0,
            sequence: SequenceCounter::new(),
            max_frame_bytes,
        })
    }

    /// Read the next file as a frame, skipping files that are too large
    pub fn next_frame(&mut self) -> Result<Frame> {
        for _ in 0..self.files.len() {
            let path = &self.files[self.next];
            self.next = (self.next + 1) % self.files.len();

            let data = fs::read(path)
                .with_context(|| format!("Failed to read input file: {}", path.display()))?;
            if data.len() > self.max_frame_bytes {
                warn!(
                    "Skipping {} ({} bytes exceeds {} byte frames)",
                    path.display(),
                    data.len(),
                    self.max_frame_bytes
                );
                continue;
            }

            debug!("Producing frame from {}", path.display());
            return Ok(self.sequence.frame(data));
        }

        Err(anyhow!("Every input file exceeds {} bytes", self.max_frame_bytes))
    }
}

/// Writes each delivered frame to `latest.bin` in a directory
///
/// The file is replaced atomically, so readers always see a whole frame.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub const FILE_NAME: &'static str = "latest.bin";

    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }

    fn write(&self, frame: &Frame) -> std::io::Result<()> {
        let tmp = self.dir.join(format!(".{}.tmp", Self::FILE_NAME));
        fs::write(&tmp, frame.data())?;
        fs::rename(&tmp, self.latest_path())
    }
}

impl FrameSink for DirectorySink {
    fn deliver(&mut self, frame: Frame) {
        if let Err(e) = self.write(&frame) {
            warn!("Failed to write frame {}: {}", frame.sequence(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_producer_cycles_in_name_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.png"), b"second").unwrap();
        fs::write(dir.path().join("a.png"), b"first").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let mut producer = FileProducer::open(dir.path(), 1024).unwrap();
        let frames: Vec<Frame> = (0..3).map(|_| producer.next_frame().unwrap()).collect();

        assert_eq!(frames[0].data().as_ref(), b"first");
        assert_eq!(frames[1].data().as_ref(), b"second");
        assert_eq!(frames[2].data().as_ref(), b"first");
        assert_eq!(
            frames.iter().map(Frame::sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_producer_skips_oversized_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("big"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("small"), b"ok").unwrap();

        let mut producer = FileProducer::open(dir.path(), 10).unwrap();
        assert_eq!(producer.next_frame().unwrap().data().as_ref(), b"ok");
        assert_eq!(producer.next_frame().unwrap().data().as_ref(), b"ok");
    }

    #[test]
    fn test_producer_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(FileProducer::open(dir.path(), 10).is_err());
    }

    #[test]
    fn test_sink_overwrites_latest() {
        let dir = TempDir::new().unwrap();
        let mut sink = DirectorySink::new(&dir.path().join("out")).unwrap();

        sink.deliver(Frame::new(1, b"one".to_vec()));
        sink.deliver(Frame::new(2, b"two".to_vec()));

        assert_eq!(fs::read(sink.latest_path()).unwrap(), b"two");
    }
}
