//! User-facing status output and the install transcript.
//!
//! Every line printed to the terminal is also appended, timestamped and
//! without colour, to the install log so a failed run can be diagnosed after
//! the SSH session is gone.

use std::fs::{File, OpenOptions};
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use crossterm::style::Stylize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Progress,
    Success,
    Warning,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Self::Progress => "....",
            Self::Success => " OK ",
            Self::Warning => "WARN",
            Self::Error => "FAIL",
        }
    }
}

enum Sink {
    File(File),
    Memory(Vec<String>),
    Discard,
}

/// Cheap to clone; all clones share one transcript.
#[derive(Clone)]
pub struct Console {
    sink: Arc<Mutex<Sink>>,
    color: bool,
    echo_to_terminal: bool,
}

impl Console {
    /// Print to the terminal and append to `install_log`.
    pub fn open(install_log: &Path) -> std::io::Result<Self> {
        if let Some(parent) = install_log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(install_log)?;
        Ok(Self {
            sink: Arc::new(Mutex::new(Sink::File(file))),
            color: std::io::stdout().is_terminal(),
            echo_to_terminal: true,
        })
    }

    /// Terminal only, no transcript.
    pub fn terminal() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Discard)),
            color: std::io::stdout().is_terminal(),
            echo_to_terminal: true,
        }
    }

    /// Keep the transcript in memory and print nothing. Used by tests.
    pub fn in_memory() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Memory(Vec::new()))),
            color: false,
            echo_to_terminal: false,
        }
    }

    /// Transcript lines captured by an [`in_memory`](Self::in_memory) console.
    pub fn lines(&self) -> Vec<String> {
        match &*self.lock() {
            Sink::Memory(lines) => lines.clone(),
            _ => Vec::new(),
        }
    }

    pub fn heading(&self, title: &str) {
        tracing::info!(section = title, "section");
        let line = format!("── {title} ──");
        if self.echo_to_terminal {
            if self.color {
                println!("\n{}", line.as_str().bold());
            } else {
                println!("\n{line}");
            }
        }
        self.record(&line);
    }

    pub fn progress(&self, msg: impl AsRef<str>) {
        self.status(Level::Progress, msg.as_ref());
    }

    pub fn success(&self, msg: impl AsRef<str>) {
        self.status(Level::Success, msg.as_ref());
    }

    pub fn warning(&self, msg: impl AsRef<str>) {
        self.status(Level::Warning, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.status(Level::Error, msg.as_ref());
    }

    pub fn status(&self, level: Level, msg: &str) {
        match level {
            Level::Progress | Level::Success => tracing::info!("{msg}"),
            Level::Warning => tracing::warn!("{msg}"),
            Level::Error => tracing::error!("{msg}"),
        }
        let line = format!("[{}] {msg}", level.tag());
        if self.echo_to_terminal {
            if self.color {
                let tag = match level {
                    Level::Progress => level.tag().cyan(),
                    Level::Success => level.tag().green(),
                    Level::Warning => level.tag().yellow(),
                    Level::Error => level.tag().red().bold(),
                };
                println!("[{tag}] {msg}");
            } else {
                println!("{line}");
            }
        }
        self.record(&line);
    }

    /// Pass through one line of subprocess output.
    pub fn echo(&self, line: &str) {
        if self.echo_to_terminal {
            println!("    {line}");
        }
        self.record(&format!("    {line}"));
    }

    pub fn flush(&self) {
        let _ = std::io::stdout().flush();
        if let Sink::File(file) = &mut *self.lock() {
            let _ = file.flush();
            let _ = file.sync_data();
        }
    }

    fn record(&self, line: &str) {
        match &mut *self.lock() {
            Sink::File(file) => {
                let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
                // The transcript is best-effort; a full disk must not stop provisioning.
                let _ = writeln!(file, "{ts} {line}");
            }
            Sink::Memory(lines) => lines.push(line.to_string()),
            Sink::Discard => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sink> {
        self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
