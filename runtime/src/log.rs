//! Container log sink writing the CRI log format.
//!
//! Each line is `<RFC3339Nano timestamp> <stream> F <content>`, appended to
//! the container's log file. The file is opened per write, so log rotation by
//! the kubelet never needs a reopen.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Appends CRI-formatted lines to a container log file.
#[derive(Debug, Clone)]
pub struct ContainerLogger {
    path: Option<PathBuf>,
}

impl ContainerLogger {
    /// Logger for the given path; an empty path discards everything.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self {
            path: (!path.as_os_str().is_empty()).then(|| path.to_path_buf()),
        }
    }

    /// Logger that discards everything.
    pub fn discard() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append `data` as one log line per newline-separated chunk.
    pub fn append(&self, stream: LogStream, data: &[u8]) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if data.is_empty() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = Vec::with_capacity(data.len() + 64);
        let timestamp =
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let data = data.strip_suffix(b"\n").unwrap_or(data);
        for line in data.split(|b| *b == b'\n') {
            out.extend_from_slice(timestamp.as_bytes());
            out.push(b' ');
            out.extend_from_slice(stream.as_str().as_bytes());
            out.extend_from_slice(b" F ");
            out.extend_from_slice(line);
            out.push(b'\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&out)
    }

    /// Append an informational line to stdout, logging on failure.
    pub fn message(&self, message: &str) {
        if let Err(e) = self.append(LogStream::Stdout, message.as_bytes()) {
            tracing::warn!(error = %e, "Failed to write container log");
        }
    }

    /// A writer that turns a byte stream into log lines.
    pub fn writer(&self, stream: LogStream) -> LogWriter {
        LogWriter {
            logger: self.clone(),
            stream,
            pending: Vec::new(),
        }
    }
}

/// Line-buffering [`Write`] adapter over a [`ContainerLogger`].
pub struct LogWriter {
    logger: ContainerLogger,
    stream: LogStream,
    pending: Vec<u8>,
}

impl LogWriter {
    fn write_complete_lines(&mut self) -> std::io::Result<()> {
        if let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') {
            let rest = self.pending.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.pending, rest);
            self.logger.append(self.stream, &complete)?;
        }
        Ok(())
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.write_complete_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.write_complete_lines()?;
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.logger.append(self.stream, &rest)?;
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
