//! Format-independent decoding contract.
//!
//! A [`SegmentDecoder`] turns the raw bytes of one file into per-channel
//! [`Segment`]s. Recoverable damage (a bad record, a short buffer, a
//! timestamp that runs backwards) is reported through [`Diagnostics`] and
//! decoding continues; only an unreadable header fails the file.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::Result;
use crate::types::{ChannelDescriptor, ChannelId, Segment};

/// Everything decoded from one file.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFile {
    pub source: String,
    /// Interval covered by the file's readable records
    pub start_ms: i64,
    pub end_ms: i64,
    pub segments: Vec<Segment>,
}

pub trait SegmentDecoder: Send + Sync {
    /// Decodes the listed channels of one file. Channels absent from the
    /// file yield no segments.
    fn decode(
        &self,
        source: &str,
        bytes: &[u8],
        channels: &[ChannelDescriptor],
        diagnostics: &mut Diagnostics,
    ) -> Result<DecodedFile>;
}

/// Decodes a single channel from a buffer.
pub fn decode_channel(
    decoder: &dyn SegmentDecoder,
    source: &str,
    bytes: &[u8],
    descriptor: &ChannelDescriptor,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<Segment>> {
    descriptor.validate()?;
    let file = decoder.decode(source, bytes, std::slice::from_ref(descriptor), diagnostics)?;
    Ok(file.segments)
}

/// Drops samples whose timestamp is earlier than the last kept one.
pub(crate) fn retain_monotonic<T>(
    items: Vec<T>,
    timestamp: impl Fn(&T) -> i64,
    source: &str,
    channel: ChannelId,
    diagnostics: &mut Diagnostics,
) -> Vec<T> {
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    let mut last: Option<i64> = None;

    for item in items {
        let ts = timestamp(&item);
        if let Some(previous_ms) = last {
            if ts < previous_ms {
                diagnostics.push(
                    DiagnosticKind::TimestampRegression { previous_ms, timestamp_ms: ts },
                    source,
                    Some(channel),
                    format!("timestamp {} earlier than {}, sample dropped", ts, previous_ms),
                );
                continue;
            }
        }
        last = Some(ts);
        kept.push(item);
    }

    kept
}

/// Returns how many samples can actually be decoded, reporting a
/// disagreement between the declared and available counts.
pub(crate) fn reconcile_length(
    declared: i64,
    actual: i64,
    source: &str,
    channel: ChannelId,
    diagnostics: &mut Diagnostics,
) -> i64 {
    if declared != actual {
        diagnostics.push(
            DiagnosticKind::LengthMismatch { declared, actual },
            source,
            Some(channel),
            format!("declared {} samples, buffer holds {}", declared, actual),
        );
    }
    declared.min(actual).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventSample;

    #[test]
    fn test_retain_monotonic_drops_regressions() {
        let events = vec![
            EventSample { timestamp_ms: 10, value: 1.0 },
            EventSample { timestamp_ms: 20, value: 2.0 },
            EventSample { timestamp_ms: 15, value: 3.0 },
            EventSample { timestamp_ms: 20, value: 4.0 },
        ];
        let mut diags = Diagnostics::new();
        let kept = retain_monotonic(events, |e| e.timestamp_ms, "x_EVE.edf", ChannelId::Hypopnea, &mut diags);

        assert_eq!(kept.iter().map(|e| e.value).collect::<Vec<_>>(), vec![1.0, 2.0, 4.0]);
        assert_eq!(diags.count("TimestampRegression"), 1);
    }

    #[test]
    fn test_reconcile_length() {
        let mut diags = Diagnostics::new();
        assert_eq!(reconcile_length(100, 100, "a", ChannelId::Flow, &mut diags), 100);
        assert!(diags.is_empty());

        assert_eq!(reconcile_length(100, 75, "a", ChannelId::Flow, &mut diags), 75);
        assert_eq!(reconcile_length(50, 75, "a", ChannelId::Flow, &mut diags), 50);
        assert_eq!(diags.count("LengthMismatch"), 2);
    }
}
