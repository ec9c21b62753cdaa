//! File and stdout stream sinks
//!
//! Writes raw frame bytes with no container; diagnostics stay on stderr so
//! stdout remains a clean data channel.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

enum StreamTarget {
    File { file: File, path: PathBuf },
    Stdout(std::io::Stdout),
}

/// Raw frame stream to a file or stdout
pub struct StreamSink {
    target: StreamTarget,
    frames_written: u64,
    bytes_written: u64,
}

impl StreamSink {
    /// Create or truncate a file to stream frames into
    pub fn file(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| Error::StreamOutput(format!("Failed to create {}: {}", path.display(), e)))?;
        info!("Streaming frames to {}", path.display());

        Ok(Self {
            target: StreamTarget::File { file, path: path.to_path_buf() },
            frames_written: 0,
            bytes_written: 0,
        })
    }

    /// Stream frames to standard output
    pub fn stdout() -> Self {
        Self {
            target: StreamTarget::Stdout(std::io::stdout()),
            frames_written: 0,
            bytes_written: 0,
        }
    }

    /// Write one frame. A short write loses data the reader can never
    /// recover, so it is an error the pump treats as fatal.
    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let written = match &mut self.target {
            StreamTarget::File { file, .. } => {
                let n = file.write(data)?;
                file.flush()?;
                n
            }
            StreamTarget::Stdout(stdout) => {
                let mut lock = stdout.lock();
                let n = lock.write(data)?;
                lock.flush()?;
                n
            }
        };

        self.bytes_written += written as u64;
        if written < data.len() {
            return Err(Error::ShortWrite { written, expected: data.len() });
        }

        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn describe(&self) -> String {
        match &self.target {
            StreamTarget::File { path, .. } => path.display().to_string(),
            StreamTarget::Stdout(_) => "stdout".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn file_sink_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.raw");

        let mut sink = StreamSink::file(&path).unwrap();
        sink.write_frame(&[1, 2, 3, 4]).unwrap();
        sink.write_frame(&[5, 6]).unwrap();
        assert_eq!(sink.frames_written(), 2);
        assert_eq!(sink.bytes_written(), 6);

        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn file_sink_truncates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.raw");
        std::fs::write(&path, b"stale").unwrap();

        let mut sink = StreamSink::file(&path).unwrap();
        sink.write_frame(&[9]).unwrap();
        drop(sink);

        assert_eq!(std::fs::read(&path).unwrap(), vec![9]);
    }

    #[test]
    fn describe_names_the_target() {
        assert_eq!(StreamSink::stdout().describe(), "stdout");
    }
}
