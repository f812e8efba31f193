//! User-visible status lines

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One status update, stamped with the time it was raised.
#[derive(Debug, Clone, Serialize)]
pub struct StatusLine {
    pub at: DateTime<Utc>,
    pub text: String,
}

impl StatusLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            text: text.into(),
        }
    }

    pub fn timestamp(&self) -> String {
        self.at.to_rfc3339()
    }
}

/// Status history, newest last.
#[derive(Debug, Default)]
pub struct StatusBoard {
    lines: Vec<StatusLine>,
}

impl StatusBoard {
    pub fn push(&mut self, line: StatusLine) {
        self.lines.push(line);
    }

    /// The text currently shown to the user.
    pub fn current(&self) -> Option<&str> {
        self.lines.last().map(|l| l.text.as_str())
    }

    pub fn lines(&self) -> &[StatusLine] {
        &self.lines
    }
}
