//! Non-fatal findings collected while importing.
//!
//! Partial success is a normal outcome: a run returns whatever sessions and
//! statistics it could produce together with the diagnostics explaining what
//! was skipped.

use std::fmt;

use crate::types::ChannelId;

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    /// A data record or annotation that could not be decoded; it was skipped.
    MalformedRecord { record: usize },
    /// Declared sample count disagrees with what the buffer holds.
    LengthMismatch { declared: i64, actual: i64 },
    /// An event/flag timestamp went backwards; the sample was dropped.
    TimestampRegression { previous_ms: i64, timestamp_ms: i64 },
    /// The whole file was unreadable and treated as absent.
    HeaderParseError,
    /// A reconciled session had no data or no duration and was discarded.
    EmptySession { start_ms: i64, end_ms: i64 },
    /// A channel blob failed to decode; the session kept its other channels.
    DecodeIntegrityError,
    /// A channel could not be encoded (e.g. runs at differing rates) and was
    /// left out of its session.
    EncodeError,
    /// A statistic could not be computed from its inputs and was left null.
    AggregationInputMissing { metric: &'static str },
    /// The gateway rejected a write.
    PersistenceConflict,
    /// A gateway write failed for a reason other than a conflict; not retried.
    PersistenceError,
}

impl DiagnosticKind {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticKind::MalformedRecord { .. } => "MalformedRecord",
            DiagnosticKind::LengthMismatch { .. } => "LengthMismatch",
            DiagnosticKind::TimestampRegression { .. } => "TimestampRegression",
            DiagnosticKind::HeaderParseError => "HeaderParseError",
            DiagnosticKind::EmptySession { .. } => "EmptySession",
            DiagnosticKind::DecodeIntegrityError => "DecodeIntegrityError",
            DiagnosticKind::EncodeError => "EncodeError",
            DiagnosticKind::AggregationInputMissing { .. } => "AggregationInputMissing",
            DiagnosticKind::PersistenceConflict => "PersistenceConflict",
            DiagnosticKind::PersistenceError => "PersistenceError",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// File name, session key or date the finding belongs to
    pub source: String,
    pub channel: Option<ChannelId>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.name(), self.source)?;
        if let Some(channel) = self.channel {
            write!(f, " ({})", channel.name())?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Accumulator handed down through the pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        kind: DiagnosticKind,
        source: &str,
        channel: Option<ChannelId>,
        message: impl Into<String>,
    ) {
        let diagnostic = Diagnostic {
            kind,
            source: source.to_string(),
            channel,
            message: message.into(),
        };
        tracing::warn!(
            kind = diagnostic.kind.name(),
            source = %diagnostic.source,
            "{}",
            diagnostic.message
        );
        self.entries.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Number of entries of the given kind name, e.g. `"MalformedRecord"`.
    pub fn count(&self, name: &str) -> usize {
        self.entries.iter().filter(|d| d.kind.name() == name).count()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}
