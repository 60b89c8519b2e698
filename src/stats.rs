//! Session, day and period statistics.
//!
//! Everything here is a pure function of its inputs. Pools are sorted before
//! any reduction and durations are summed in integer milliseconds, so the
//! order in which sessions or days are supplied never changes the result.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate};
use serde::Deserialize;

use crate::config::IngestConfig;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::types::{ChannelData, ChannelId, Session};
use crate::utils::ms_to_datetime;
use crate::MS_PER_HOUR;

/// Thresholds the engine needs, split from [`IngestConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsConfig {
    pub usage_threshold_hours: f64,
    pub day_split_hour: u32,
    pub spo2_valid_min: f64,
    pub pulse_valid_min: f64,
    pub pulse_valid_max: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for StatsConfig {
    fn from(config: &IngestConfig) -> Self {
        StatsConfig {
            usage_threshold_hours: config.usage_threshold_hours,
            day_split_hour: config.day_split_hour,
            spo2_valid_min: config.spo2_valid_min,
            pulse_valid_min: config.pulse_valid_min,
            pulse_valid_max: config.pulse_valid_max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl PeriodType {
    pub fn name(&self) -> &'static str {
        match self {
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
            PeriodType::Yearly => "yearly",
        }
    }

    /// Inclusive bounds of the period containing `date`. Weeks start on
    /// Monday.
    pub fn bounds(&self, date: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            PeriodType::Daily => (date, date),
            PeriodType::Weekly => {
                let start = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                (start, start + Duration::days(6))
            }
            PeriodType::Monthly => {
                let start = date.with_day(1).unwrap_or(date);
                let next = if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
                };
                (start, next.map_or(date, |n| n - Duration::days(1)))
            }
            PeriodType::Yearly => (
                NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
                NaiveDate::from_ymd_opt(date.year(), 12, 31).unwrap_or(date),
            ),
        }
    }
}

/// Therapy day a session belongs to: the date of its start shifted back by
/// the day split hour.
pub fn therapy_date(start_ms: i64, day_split_hour: u32) -> Option<NaiveDate> {
    ms_to_datetime(start_ms - day_split_hour as i64 * MS_PER_HOUR).map(|dt| dt.date())
}

/// Linear interpolation between order statistics at rank `p * (n - 1)`.
/// `sorted` must be ascending.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&p) {
        return None;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

fn sorted_finite(samples: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted
}

fn mean(sorted: &[f64]) -> f64 {
    sorted.iter().sum::<f64>() / sorted.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub min: f64,
    pub median: f64,
    pub p70: f64,
    pub p95: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let sorted = sorted_finite(samples);
        Some(Percentiles {
            min: *sorted.first()?,
            median: percentile(&sorted, 0.5)?,
            p70: percentile(&sorted, 0.7)?,
            p95: percentile(&sorted, 0.95)?,
            max: *sorted.last()?,
            mean: mean(&sorted),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OximetrySummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl OximetrySummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let sorted = sorted_finite(samples);
        Some(OximetrySummary {
            min: *sorted.first()?,
            max: *sorted.last()?,
            mean: mean(&sorted),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl SignalSummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let sorted = sorted_finite(samples);
        Some(SignalSummary {
            min: *sorted.first()?,
            max: *sorted.last()?,
            mean: mean(&sorted),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub obstructive: u32,
    pub hypopnea: u32,
    pub central: u32,
    pub unclassified: u32,
    /// Counted but not part of AHI
    pub mixed: u32,
    pub flow_limitation: u32,
    pub rera: u32,
}

impl EventCounts {
    pub fn from_session(session: &Session) -> Self {
        let count = |id| session.channel(id).map_or(0, |c| c.data.sample_count() as u32);
        EventCounts {
            obstructive: count(ChannelId::ObstructiveApnea),
            hypopnea: count(ChannelId::Hypopnea),
            central: count(ChannelId::CentralApnea),
            unclassified: count(ChannelId::UnclassifiedApnea),
            mixed: count(ChannelId::MixedApnea),
            flow_limitation: count(ChannelId::FlowLimitation),
            rera: count(ChannelId::Rera),
        }
    }

    pub fn add(&mut self, other: &EventCounts) {
        self.obstructive += other.obstructive;
        self.hypopnea += other.hypopnea;
        self.central += other.central;
        self.unclassified += other.unclassified;
        self.mixed += other.mixed;
        self.flow_limitation += other.flow_limitation;
        self.rera += other.rera;
    }

    /// Events counted by AHI
    pub fn apnea_hypopnea(&self) -> u32 {
        self.obstructive + self.hypopnea + self.central
    }

    pub fn total(&self) -> u64 {
        [
            self.obstructive,
            self.hypopnea,
            self.central,
            self.unclassified,
            self.mixed,
            self.flow_limitation,
            self.rera,
        ]
        .iter()
        .map(|&c| c as u64)
        .sum()
    }
}

/// Full-resolution samples feeding the percentile and summary metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplePools {
    pub pressure: Vec<f64>,
    pub leak: Vec<f64>,
    /// Valid readings only
    pub spo2: Vec<f64>,
    pub pulse: Vec<f64>,
    pub respiratory_rate: Vec<f64>,
    pub tidal_volume: Vec<f64>,
    pub minute_ventilation: Vec<f64>,
    /// Time spent with valid SpO2 below 90%
    pub spo2_below_90_ms: i64,
    /// Channels that contributed, even if all their samples were invalid
    pub present: BTreeSet<ChannelId>,
}

impl SamplePools {
    pub fn from_session(session: &Session, config: &StatsConfig) -> Self {
        let mut pools = SamplePools::default();
        for channel in &session.channels {
            pools.add_channel(channel.descriptor.id, &channel.data, config);
        }
        pools
    }

    pub fn add_channel(&mut self, id: ChannelId, data: &ChannelData, config: &StatsConfig) {
        let target = match id {
            ChannelId::Pressure => &mut self.pressure,
            ChannelId::Leak => &mut self.leak,
            ChannelId::RespiratoryRate => &mut self.respiratory_rate,
            ChannelId::TidalVolume => &mut self.tidal_volume,
            ChannelId::MinuteVentilation => &mut self.minute_ventilation,
            ChannelId::SpO2 => {
                self.present.insert(id);
                self.add_spo2(data, config);
                return;
            }
            ChannelId::Pulse => {
                self.present.insert(id);
                // 过滤无效读数
                self.pulse.extend(
                    data.values()
                        .into_iter()
                        .filter(|v| *v >= config.pulse_valid_min && *v <= config.pulse_valid_max),
                );
                return;
            }
            _ => return,
        };
        self.present.insert(id);
        target.extend(data.values());
    }

    fn add_spo2(&mut self, data: &ChannelData, config: &StatsConfig) {
        let valid = |v: f64| v >= config.spo2_valid_min && v <= 100.0;
        match data {
            ChannelData::Waveform(runs) => {
                for run in runs {
                    let step_ms = (1000.0 / run.sample_rate).round() as i64;
                    for &v in run.values.iter().filter(|v| valid(**v)) {
                        self.spo2.push(v);
                        if v < 90.0 {
                            self.spo2_below_90_ms += step_ms;
                        }
                    }
                }
            }
            other => self.spo2.extend(other.values().into_iter().filter(|v| valid(*v))),
        }
    }

    pub fn merge(&mut self, other: SamplePools) {
        self.pressure.extend(other.pressure);
        self.leak.extend(other.leak);
        self.spo2.extend(other.spo2);
        self.pulse.extend(other.pulse);
        self.respiratory_rate.extend(other.respiratory_rate);
        self.tidal_volume.extend(other.tidal_volume);
        self.minute_ventilation.extend(other.minute_ventilation);
        self.spo2_below_90_ms += other.spo2_below_90_ms;
        self.present.extend(other.present);
    }
}

/// Metrics shared by sessions and days.
#[derive(Debug, Clone, PartialEq)]
pub struct TherapyMetrics {
    pub therapy_ms: i64,
    pub therapy_hours: f64,
    pub counts: EventCounts,
    pub ahi: Option<f64>,
    pub rdi: Option<f64>,
    pub oai: Option<f64>,
    pub cai: Option<f64>,
    pub hi: Option<f64>,
    pub pressure: Option<Percentiles>,
    pub leak: Option<Percentiles>,
    pub spo2: Option<OximetrySummary>,
    pub pulse: Option<OximetrySummary>,
    pub spo2_seconds_below_90: Option<f64>,
    pub respiratory_rate: Option<SignalSummary>,
    pub tidal_volume: Option<SignalSummary>,
    pub minute_ventilation: Option<SignalSummary>,
}

pub type SessionStatistics = TherapyMetrics;

impl TherapyMetrics {
    /// Builds metrics from summed inputs. `source` names the session or day
    /// in diagnostics.
    pub fn from_inputs(
        therapy_ms: i64,
        counts: EventCounts,
        pools: &SamplePools,
        source: &str,
        diagnostics: &mut Diagnostics,
    ) -> Self {
        let therapy_hours = therapy_ms as f64 / MS_PER_HOUR as f64;
        let index = |events: u32| (therapy_hours > 0.0).then(|| events as f64 / therapy_hours);
        if therapy_hours <= 0.0 {
            missing(diagnostics, source, "ahi", "no therapy time, indices left empty");
        }

        let mut present_but_empty = |id: ChannelId, metric: &'static str, samples: &[f64]| {
            if pools.present.contains(&id) && samples.is_empty() {
                missing(diagnostics, source, metric, "channel present but no valid samples");
            }
        };
        present_but_empty(ChannelId::Pressure, "pressure", &pools.pressure);
        present_but_empty(ChannelId::Leak, "leak", &pools.leak);
        present_but_empty(ChannelId::SpO2, "spo2", &pools.spo2);
        present_but_empty(ChannelId::Pulse, "pulse", &pools.pulse);

        let spo2 = OximetrySummary::from_samples(&pools.spo2);
        TherapyMetrics {
            therapy_ms,
            therapy_hours,
            counts,
            ahi: index(counts.apnea_hypopnea()),
            rdi: index(counts.apnea_hypopnea() + counts.rera),
            oai: index(counts.obstructive),
            cai: index(counts.central),
            hi: index(counts.hypopnea),
            pressure: Percentiles::from_samples(&pools.pressure),
            leak: Percentiles::from_samples(&pools.leak),
            spo2_seconds_below_90: spo2.map(|_| pools.spo2_below_90_ms as f64 / 1000.0),
            spo2,
            pulse: OximetrySummary::from_samples(&pools.pulse),
            respiratory_rate: SignalSummary::from_samples(&pools.respiratory_rate),
            tidal_volume: SignalSummary::from_samples(&pools.tidal_volume),
            minute_ventilation: SignalSummary::from_samples(&pools.minute_ventilation),
        }
    }
}

fn missing(diagnostics: &mut Diagnostics, source: &str, metric: &'static str, message: &str) {
    diagnostics.push(DiagnosticKind::AggregationInputMissing { metric }, source, None, message);
}

/// Statistics of one reconciled session.
pub fn session_statistics(
    session: &Session,
    config: &StatsConfig,
    source: &str,
    diagnostics: &mut Diagnostics,
) -> SessionStatistics {
    let pools = SamplePools::from_session(session, config);
    TherapyMetrics::from_inputs(
        session.duration_ms(),
        EventCounts::from_session(session),
        &pools,
        source,
        diagnostics,
    )
}

/// What a stored session contributes to its day.
#[derive(Debug, Clone, PartialEq)]
pub struct DayInput {
    pub therapy_ms: i64,
    pub counts: EventCounts,
    pub pools: SamplePools,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayStatistics {
    pub date: NaiveDate,
    pub session_count: u32,
    pub metrics: TherapyMetrics,
}

/// Sums counts and therapy time, pools samples, and recomputes every index
/// from the sums.
pub fn aggregate_day(date: NaiveDate, inputs: Vec<DayInput>, diagnostics: &mut Diagnostics) -> DayStatistics {
    let session_count = inputs.len() as u32;
    let mut therapy_ms = 0i64;
    let mut counts = EventCounts::default();
    let mut pools = SamplePools::default();
    for input in inputs {
        therapy_ms += input.therapy_ms;
        counts.add(&input.counts);
        pools.merge(input.pools);
    }

    let source = date.to_string();
    if session_count == 0 {
        missing(diagnostics, &source, "sessions", "no sessions for day");
    }
    DayStatistics {
        date,
        session_count,
        metrics: TherapyMetrics::from_inputs(therapy_ms, counts, &pools, &source, diagnostics),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodStatistics {
    pub period_type: PeriodType,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub total_days: u32,
    pub days_used: u32,
    pub compliance_rate: f64,
    /// Over used days only
    pub avg_ahi: Option<f64>,
    pub median_ahi: Option<f64>,
    pub total_therapy_hours: f64,
    /// Per calendar day of the period
    pub avg_therapy_hours: f64,
    pub total_events: u64,
}

/// Rolls day rows up into one period. Days outside `[start, end]` are
/// ignored; days without a row count as unused.
pub fn aggregate_period(
    period_type: PeriodType,
    start: NaiveDate,
    end: NaiveDate,
    days: &[DayStatistics],
    usage_threshold_hours: f64,
    diagnostics: &mut Diagnostics,
) -> PeriodStatistics {
    let total_days = ((end - start).num_days() + 1).max(0) as u32;

    let mut in_range: Vec<&DayStatistics> = days.iter().filter(|d| d.date >= start && d.date <= end).collect();
    in_range.sort_by_key(|d| d.date);
    in_range.dedup_by_key(|d| d.date);

    let used: Vec<&DayStatistics> = in_range
        .iter()
        .copied()
        .filter(|d| d.metrics.therapy_hours >= usage_threshold_hours)
        .collect();
    let days_used = used.len() as u32;

    let mut ahis: Vec<f64> = used.iter().filter_map(|d| d.metrics.ahi).collect();
    ahis.sort_by(f64::total_cmp);
    let (avg_ahi, median_ahi) = if ahis.is_empty() {
        missing(
            diagnostics,
            &format!("{} {}", period_type.name(), start),
            "ahi",
            "no used days in period",
        );
        (None, None)
    } else {
        (Some(mean(&ahis)), percentile(&ahis, 0.5))
    };

    let therapy_ms: i64 = in_range.iter().map(|d| d.metrics.therapy_ms).sum();
    let total_therapy_hours = therapy_ms as f64 / MS_PER_HOUR as f64;

    PeriodStatistics {
        period_type,
        start,
        end,
        total_days,
        days_used,
        compliance_rate: if total_days > 0 { days_used as f64 / total_days as f64 } else { 0.0 },
        avg_ahi,
        median_ahi,
        total_therapy_hours,
        avg_therapy_hours: if total_days > 0 { total_therapy_hours / total_days as f64 } else { 0.0 },
        total_events: in_range.iter().map(|d| d.metrics.counts.total()).sum(),
    }
}
