//! Append-only operation log.
//!
//! One line per store operation plus the closing summary lines. This is
//! separate from diagnostic `tracing` output: the format is fixed so that
//! it can be post-processed.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{Local, SecondsFormat};
use tracing::warn;

use crate::ServerSummary;

/// A store operation worth a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEvent<'a> {
    Open { name: &'a str },
    OpenLock { name: &'a str },
    Close { name: &'a str },
    Write { name: &'a str, size: usize },
    Read { name: &'a str, size: usize },
    Lock { name: &'a str },
    Unlock { name: &'a str },
    Remove { name: &'a str },
    Replace { name: &'a str, size: usize },
}

impl OpEvent<'_> {
    fn render(&self, out: &mut String, ts: &str) -> std::fmt::Result {
        match *self {
            OpEvent::Open { name } => writeln!(out, "openfile:{} [{}]", name, ts),
            OpEvent::OpenLock { name } => writeln!(out, "openlock:{} [{}]", name, ts),
            OpEvent::Close { name } => writeln!(out, "closefile:{} [{}]", name, ts),
            OpEvent::Write { name, size } => {
                writeln!(out, "writeinfo:{},{} [{}]", name, size, ts)?;
                writeln!(out, "write:{}", size)
            }
            OpEvent::Read { name, size } => {
                writeln!(out, "readinfo:{},{} [{}]", name, size, ts)?;
                writeln!(out, "read:{}", size)
            }
            OpEvent::Lock { name } => writeln!(out, "lockfile:{} [{}]", name, ts),
            OpEvent::Unlock { name } => writeln!(out, "unlockfile:{} [{}]", name, ts),
            OpEvent::Remove { name } => writeln!(out, "removefile:{} [{}]", name, ts),
            OpEvent::Replace { name, size } => {
                writeln!(out, "replacefile:{},{}bytes [{}]", name, size, ts)
            }
        }
    }
}

pub struct OpLog {
    sink: Option<Mutex<LineWriter<File>>>,
}

impl OpLog {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Some(Mutex::new(LineWriter::new(file))),
        })
    }

    /// A log that discards everything
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn record(&self, event: OpEvent<'_>) {
        if self.sink.is_none() {
            return;
        }
        let ts = Local::now().to_rfc3339_opts(SecondsFormat::Millis, false);
        let mut text = String::new();
        if event.render(&mut text, &ts).is_ok() {
            self.write_text(&text);
        }
    }

    pub fn write_summary(&self, summary: &ServerSummary) {
        let mut text = format!(
            "max_stored_bytes:{}\nmax_stored_files:{}\nreplaced_files:{}\n",
            summary.max_stored_bytes, summary.max_stored_files, summary.replaced_files
        );
        for (worker, served) in summary.served_per_worker.iter().enumerate() {
            let _ = writeln!(text, "worker:{},served:{}", worker, served);
        }
        let _ = writeln!(text, "max_connections:{}", summary.max_concurrent_connections);
        self.write_text(&text);
    }

    fn write_text(&self, text: &str) {
        let Some(sink) = &self.sink else {
            return;
        };
        let mut writer = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writer.write_all(text.as_bytes()) {
            warn!(error = %e, "Failed to append to operation log");
        }
    }
}
