//! Reconciles the segments of one recording into sessions.
//!
//! Segments are ordered by start instant and grouped while the gap to the
//! running group end stays below the threshold. Inside a group every channel
//! is resolved on its own: segments are ranked by covered duration (longer
//! first, then earlier start, then input order) and each lower-ranked segment
//! loses the samples that fall inside an interval already claimed by a
//! higher-ranked one. Missing stretches stay missing.

use std::collections::BTreeMap;

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::types::{
    ChannelData, ChannelId, ChannelKind, EventSample, FlagSample, Segment, Session, SessionChannel, WaveformRun,
};

pub const DEFAULT_GAP_THRESHOLD_MS: i64 = 5 * 60 * 1000;

/// Groups and reconciles segments. Sessions come back ordered by start.
pub fn merge_segments(segments: Vec<Segment>, gap_threshold_ms: i64, diagnostics: &mut Diagnostics) -> Vec<Session> {
    let mut order: Vec<usize> = (0..segments.len()).collect();
    order.sort_by_key(|&i| (segments[i].start_ms, segments[i].end_ms, i));

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut group_end = i64::MIN;
    for i in order {
        let segment = &segments[i];
        match groups.last_mut() {
            Some(group) if segment.start_ms - group_end < gap_threshold_ms => {
                group.push(i);
                group_end = group_end.max(segment.end_ms);
            }
            _ => {
                groups.push(vec![i]);
                group_end = segment.end_ms;
            }
        }
    }

    let mut slots: Vec<Option<Segment>> = segments.into_iter().map(Some).collect();
    let mut sessions = Vec::with_capacity(groups.len());

    for group in groups {
        let members: Vec<(usize, Segment)> = group
            .into_iter()
            .filter_map(|i| slots[i].take().map(|segment| (i, segment)))
            .collect();
        let source = members.first().map(|(_, s)| s.source.clone()).unwrap_or_default();
        let session = build_session(members);

        let empty = session.duration_ms() <= 0 || session.channels.iter().all(|c| c.data.is_empty());
        if empty {
            diagnostics.push(
                DiagnosticKind::EmptySession { start_ms: session.start_ms, end_ms: session.end_ms },
                &source,
                None,
                "session has no samples or no duration, discarded",
            );
            continue;
        }

        tracing::debug!(
            start_ms = session.start_ms,
            end_ms = session.end_ms,
            channels = session.channels.len(),
            "merged session"
        );
        sessions.push(session);
    }

    sessions
}

fn build_session(members: Vec<(usize, Segment)>) -> Session {
    let start_ms = members.iter().map(|(_, s)| s.start_ms).min().unwrap_or(0);
    let end_ms = members.iter().map(|(_, s)| s.end_ms).max().unwrap_or(start_ms);

    let mut by_channel: BTreeMap<ChannelId, Vec<(usize, Segment)>> = BTreeMap::new();
    for (index, segment) in members {
        by_channel.entry(segment.descriptor.id).or_default().push((index, segment));
    }

    let channels = by_channel.into_values().filter_map(resolve_channel).collect();
    Session { start_ms, end_ms, channels }
}

/// Overlap resolution for one channel.
fn resolve_channel(mut pieces: Vec<(usize, Segment)>) -> Option<SessionChannel> {
    pieces.sort_by_key(|(index, s)| (std::cmp::Reverse(s.duration_ms()), s.start_ms, *index));
    let descriptor = pieces.first()?.1.descriptor.clone();

    let mut claimed: Vec<(i64, i64)> = Vec::new();
    let mut runs: Vec<WaveformRun> = Vec::new();
    let mut events: Vec<EventSample> = Vec::new();
    let mut flags: Vec<FlagSample> = Vec::new();

    for (_, segment) in pieces {
        match segment.data {
            ChannelData::Waveform(segment_runs) => {
                for run in segment_runs {
                    runs.extend(trim_run(run, &claimed));
                }
            }
            ChannelData::Events(samples) => {
                events.extend(samples.into_iter().filter(|e| !is_claimed(&claimed, e.timestamp_ms)));
            }
            ChannelData::Flags(samples) => {
                flags.extend(samples.into_iter().filter(|f| !is_claimed(&claimed, f.timestamp_ms)));
            }
        }
        if segment.end_ms > segment.start_ms {
            claimed.push((segment.start_ms, segment.end_ms));
        }
    }

    let data = match descriptor.kind {
        ChannelKind::Waveform => ChannelData::Waveform(join_runs(runs)),
        ChannelKind::Event => {
            events.sort_by_key(|e| e.timestamp_ms);
            ChannelData::Events(events)
        }
        ChannelKind::Flag => {
            flags.sort_by_key(|f| f.timestamp_ms);
            ChannelData::Flags(flags)
        }
    };

    Some(SessionChannel { descriptor, data })
}

fn is_claimed(claimed: &[(i64, i64)], timestamp_ms: i64) -> bool {
    claimed.iter().any(|&(start, end)| timestamp_ms >= start && timestamp_ms < end)
}

/// Splits a run around the claimed intervals.
fn trim_run(run: WaveformRun, claimed: &[(i64, i64)]) -> Vec<WaveformRun> {
    if claimed.iter().all(|&(start, end)| end <= run.start_ms || start >= run.end_ms()) {
        return vec![run];
    }

    let mut pieces = Vec::new();
    let mut current: Option<WaveformRun> = None;
    for (i, &value) in run.values.iter().enumerate() {
        let timestamp_ms = run.timestamp_ms(i);
        if is_claimed(claimed, timestamp_ms) {
            if let Some(piece) = current.take() {
                pieces.push(piece);
            }
            continue;
        }
        current
            .get_or_insert_with(|| WaveformRun {
                start_ms: timestamp_ms,
                sample_rate: run.sample_rate,
                values: Vec::new(),
            })
            .values
            .push(value);
    }
    pieces.extend(current);
    pieces
}

/// Orders runs and joins the ones that continue each other exactly.
fn join_runs(mut runs: Vec<WaveformRun>) -> Vec<WaveformRun> {
    runs.retain(|r| !r.is_empty());
    runs.sort_by_key(|r| r.start_ms);

    let mut joined: Vec<WaveformRun> = Vec::with_capacity(runs.len());
    for run in runs {
        match joined.last_mut() {
            Some(last) if last.sample_rate == run.sample_rate && last.end_ms() == run.start_ms => {
                last.values.extend(run.values);
            }
            _ => joined.push(run),
        }
    }
    joined
}
