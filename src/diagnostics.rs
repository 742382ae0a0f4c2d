// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! Diagnostic log sinks.
//!
//! The diagnostic log is a plain UTF-8 file separate from the structured
//! `log` output. It is handed to the runner explicitly; failing to write it
//! is reported and otherwise ignored.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use directories::UserDirs;
use parking_lot::Mutex;

/// Default diagnostic log file name inside the document directory
pub const LOG_FILE_NAME: &str = "log.txt";

/// Destination for incidental diagnostic lines
pub trait DiagnosticSink: Send {
    fn write_line(&mut self, line: &str);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn write_line(&mut self, _line: &str) {}
}

/// Appends timestamped lines to a file, creating it when appending fails
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `log.txt` in the user's document directory, or in the home directory
    /// when the platform has no document directory
    pub fn in_documents() -> Option<Self> {
        let dirs = UserDirs::new()?;
        let dir = dirs
            .document_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dirs.home_dir().to_path_buf());
        Some(Self::new(dir.join(LOG_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticSink for FileSink {
    fn write_line(&mut self, line: &str) {
        let entry = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), line);

        let appended = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(entry.as_bytes()));

        if let Err(e) = appended {
            println!("{}", e);
            if let Err(e) = fs::write(&self.path, entry.as_bytes()) {
                println!("{}", e);
            }
        }
    }
}

/// Keeps lines in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl DiagnosticSink for MemorySink {
    fn write_line(&mut self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}
