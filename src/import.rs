//! Batch import: decode, merge and encode recordings in parallel, then
//! persist sessions and recompute the affected day and period statistics.
//!
//! The ordering barrier sits between the two halves: every recording of the
//! batch is fully prepared before the first gateway call, and day statistics
//! are recomputed from everything stored for that day, not only from the
//! sessions of this batch.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;

use crate::clock::{Clock, SystemClock};
use crate::config::IngestConfig;
use crate::decoder::SegmentDecoder;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::edf::EdfPlusDecoder;
use crate::encoder::{encode_channel, EncodedChannel};
use crate::error::{IngestError, Result};
use crate::gateway::{PersistenceGateway, SessionHandle, SessionRecord, StoredSession};
use crate::merger::merge_segments;
use crate::stats::{
    aggregate_day, aggregate_period, session_statistics, therapy_date, DayInput, DayStatistics, PeriodStatistics,
    SamplePools, SessionStatistics, StatsConfig,
};
use crate::types::{Recording, SessionKey};

/// Outcome of one import run. Diagnostics explain everything that was
/// skipped; the rest was persisted.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub sessions: Vec<SessionHandle>,
    /// Sessions the gateway refused even after a retry
    pub failed_sessions: Vec<SessionKey>,
    pub days: Vec<DayStatistics>,
    pub periods: Vec<PeriodStatistics>,
    pub diagnostics: Vec<Diagnostic>,
}

struct PreparedSession {
    key: SessionKey,
    date: NaiveDate,
    start_ms: i64,
    end_ms: i64,
    statistics: SessionStatistics,
    channels: Vec<EncodedChannel>,
}

struct PreparedRecording {
    recording_id: String,
    sources: Vec<String>,
    segment_count: usize,
    sessions: Vec<PreparedSession>,
    diagnostics: Diagnostics,
}

pub struct Importer {
    config: IngestConfig,
    stats: StatsConfig,
    decoder: Box<dyn SegmentDecoder>,
    clock: Box<dyn Clock>,
    cancelled: Arc<AtomicBool>,
}

impl Importer {
    /// Validates the configuration; an invalid descriptor aborts here.
    pub fn new(config: IngestConfig) -> Result<Self> {
        config.validate()?;
        Ok(Importer {
            stats: StatsConfig::from(&config),
            config,
            decoder: Box::new(EdfPlusDecoder),
            clock: Box::new(SystemClock),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_decoder(mut self, decoder: impl SegmentDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Setting the flag stops the run before its persistence phase.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(IngestError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn import<G: PersistenceGateway + ?Sized>(
        &self,
        recordings: &[Recording],
        gateway: &mut G,
    ) -> Result<ImportReport> {
        tracing::info!(recordings = recordings.len(), profile = %self.config.profile, "import started");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_threads.unwrap_or(0))
            .thread_name(|index| format!("cpap-import-{}", index))
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to create thread pool: {e}")))?;

        // 屏障：所有记录准备完毕后才开始持久化
        let prepared = pool.install(|| {
            recordings
                .par_iter()
                .map(|recording| self.prepare_recording(recording))
                .collect::<Result<Vec<_>>>()
        })?;

        if prepared.iter().all(|p| p.segment_count == 0) {
            return Err(IngestError::NoDecodableSegments);
        }
        self.check_cancelled()?;

        let mut report = ImportReport::default();
        let mut diagnostics = Diagnostics::new();
        let mut affected: BTreeSet<NaiveDate> = BTreeSet::new();

        for recording in prepared {
            diagnostics.extend(recording.diagnostics);
            for session in recording.sessions {
                let now = self.clock.now();
                let record = SessionRecord {
                    key: session.key,
                    profile: self.config.profile.clone(),
                    recording_id: recording.recording_id.clone(),
                    date: session.date,
                    start_ms: session.start_ms,
                    end_ms: session.end_ms,
                    statistics: session.statistics,
                    sources: recording.sources.clone(),
                    created_at: now,
                    updated_at: now,
                };
                match self.persist_session(gateway, &record, &session.channels, &mut diagnostics) {
                    Some(handle) => {
                        affected.insert(record.date);
                        report.sessions.push(handle);
                    }
                    None => report.failed_sessions.push(record.key),
                }
            }
        }

        for &date in &affected {
            let stored = gateway.sessions_for_day(&self.config.profile, date)?;
            let inputs = stored.iter().map(|s| self.day_input(s, &mut diagnostics)).collect();
            let day = aggregate_day(date, inputs, &mut diagnostics);
            gateway.upsert_day_statistics(&self.config.profile, date, &day)?;
            report.days.push(day);
        }

        for &period_type in &self.config.period_types {
            let bounds: BTreeSet<(NaiveDate, NaiveDate)> = affected.iter().map(|&d| period_type.bounds(d)).collect();
            for (start, end) in bounds {
                let days = gateway.day_statistics_in_range(&self.config.profile, start, end)?;
                let period = aggregate_period(
                    period_type,
                    start,
                    end,
                    &days,
                    self.config.usage_threshold_hours,
                    &mut diagnostics,
                );
                gateway.upsert_period_statistics(&self.config.profile, period_type, start, end, &period)?;
                report.periods.push(period);
            }
        }

        report.diagnostics = diagnostics.into_vec();
        tracing::info!(
            sessions = report.sessions.len(),
            failed = report.failed_sessions.len(),
            days = report.days.len(),
            periods = report.periods.len(),
            diagnostics = report.diagnostics.len(),
            "import finished"
        );
        Ok(report)
    }

    /// Decode, merge, score and encode one recording. Only cancellation is
    /// an error here; everything else becomes a diagnostic.
    fn prepare_recording(&self, recording: &Recording) -> Result<PreparedRecording> {
        self.check_cancelled()?;

        let mut diagnostics = Diagnostics::new();
        let mut segments = Vec::new();
        let mut sources = Vec::new();

        for file in &recording.files {
            let Some(format) = self.config.format_for(&file.name) else {
                tracing::debug!(file = %file.name, "no format for file, ignored");
                continue;
            };
            match self.decoder.decode(&file.name, &file.bytes, &format.channels, &mut diagnostics) {
                Ok(decoded) => {
                    sources.push(decoded.source);
                    segments.extend(decoded.segments);
                }
                Err(e) => diagnostics.push(DiagnosticKind::HeaderParseError, &file.name, None, e.to_string()),
            }
        }

        let segment_count = segments.len();
        let merged = merge_segments(segments, self.config.gap_threshold_ms(), &mut diagnostics);

        let mut sessions = Vec::with_capacity(merged.len());
        for session in merged {
            let key = session.key(&recording.device);
            let source = key.to_string();
            let statistics = session_statistics(&session, &self.stats, &source, &mut diagnostics);

            let level = self.config.compression_level;
            let encoded: Vec<_> = session
                .channels
                .par_iter()
                .map(|channel| (channel.descriptor.id, encode_channel(channel, level)))
                .collect();

            let mut channels = Vec::with_capacity(encoded.len());
            for (id, result) in encoded {
                match result {
                    Ok(channel) => channels.push(channel),
                    Err(e) => {
                        let kind = match e {
                            IngestError::DecodeIntegrity(_) => DiagnosticKind::DecodeIntegrityError,
                            _ => DiagnosticKind::EncodeError,
                        };
                        diagnostics.push(kind, &source, Some(id), e.to_string());
                    }
                }
            }

            sessions.push(PreparedSession {
                date: therapy_date(session.start_ms, self.config.day_split_hour).unwrap_or_default(),
                start_ms: session.start_ms,
                end_ms: session.end_ms,
                key,
                statistics,
                channels,
            });
        }

        tracing::debug!(
            device = %recording.device,
            recording = %recording.recording_id,
            segments = segment_count,
            sessions = sessions.len(),
            "recording prepared"
        );

        Ok(PreparedRecording {
            recording_id: recording.recording_id.clone(),
            sources,
            segment_count,
            sessions,
            diagnostics,
        })
    }

    /// One write, one retry on conflict. Other gateway errors are not
    /// retried.
    fn persist_session<G: PersistenceGateway + ?Sized>(
        &self,
        gateway: &mut G,
        record: &SessionRecord,
        channels: &[EncodedChannel],
        diagnostics: &mut Diagnostics,
    ) -> Option<SessionHandle> {
        let source = record.key.to_string();
        for attempt in 1..=2 {
            match gateway.create_or_update_session(record, channels) {
                Ok(handle) => return Some(handle),
                Err(e @ IngestError::PersistenceConflict { .. }) if attempt == 1 => {
                    diagnostics.push(DiagnosticKind::PersistenceConflict, &source, None, format!("{}, retrying", e));
                }
                Err(e) => {
                    let kind = match e {
                        IngestError::PersistenceConflict { .. } => DiagnosticKind::PersistenceConflict,
                        _ => DiagnosticKind::PersistenceError,
                    };
                    diagnostics.push(kind, &source, None, format!("{}, session not stored", e));
                    return None;
                }
            }
        }
        None
    }

    /// Rebuilds a stored session's contribution from its row and blobs.
    fn day_input(&self, stored: &StoredSession, diagnostics: &mut Diagnostics) -> DayInput {
        let source = stored.record.key.to_string();
        let mut pools = SamplePools::default();
        for blob in &stored.blobs {
            let decoded = EncodedChannel::from_bytes(blob)
                .and_then(|encoded| encoded.decode().map(|data| (encoded.channel, data)));
            match decoded {
                Ok((id, data)) => pools.add_channel(id, &data, &self.stats),
                Err(e) => diagnostics.push(DiagnosticKind::DecodeIntegrityError, &source, None, e.to_string()),
            }
        }
        DayInput {
            therapy_ms: stored.record.end_ms - stored.record.start_ms,
            counts: stored.record.statistics.counts,
            pools,
        }
    }
}
