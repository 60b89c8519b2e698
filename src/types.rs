use std::fmt;

use serde::Deserialize;

use crate::error::{IngestError, Result};

/// Kind of samples a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Fixed-rate numeric series with implicit timestamps
    Waveform,
    /// Irregular (timestamp, value) pairs
    Event,
    /// Irregular (timestamp, bool) pairs
    Flag,
}

impl ChannelKind {
    pub fn code(&self) -> u8 {
        match self {
            ChannelKind::Waveform => 0,
            ChannelKind::Event => 1,
            ChannelKind::Flag => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChannelKind::Waveform),
            1 => Some(ChannelKind::Event),
            2 => Some(ChannelKind::Flag),
            _ => None,
        }
    }
}

/// Known signals produced by therapy devices and oximeters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelId {
    Flow,
    Pressure,
    MaskPressure,
    Leak,
    RespiratoryRate,
    TidalVolume,
    MinuteVentilation,
    #[serde(rename = "spo2")]
    SpO2,
    Pulse,
    ObstructiveApnea,
    CentralApnea,
    Hypopnea,
    UnclassifiedApnea,
    MixedApnea,
    Rera,
    FlowLimitation,
    MaskOn,
}

impl ChannelId {
    pub const ALL: [ChannelId; 17] = [
        ChannelId::Flow,
        ChannelId::Pressure,
        ChannelId::MaskPressure,
        ChannelId::Leak,
        ChannelId::RespiratoryRate,
        ChannelId::TidalVolume,
        ChannelId::MinuteVentilation,
        ChannelId::SpO2,
        ChannelId::Pulse,
        ChannelId::ObstructiveApnea,
        ChannelId::CentralApnea,
        ChannelId::Hypopnea,
        ChannelId::UnclassifiedApnea,
        ChannelId::Rera,
        ChannelId::FlowLimitation,
        ChannelId::MaskOn,
        // 新通道追加在末尾，保持已存储的编码不变
        ChannelId::MixedApnea,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChannelId::Flow => "flow",
            ChannelId::Pressure => "pressure",
            ChannelId::MaskPressure => "mask_pressure",
            ChannelId::Leak => "leak",
            ChannelId::RespiratoryRate => "respiratory_rate",
            ChannelId::TidalVolume => "tidal_volume",
            ChannelId::MinuteVentilation => "minute_ventilation",
            ChannelId::SpO2 => "spo2",
            ChannelId::Pulse => "pulse",
            ChannelId::ObstructiveApnea => "obstructive_apnea",
            ChannelId::CentralApnea => "central_apnea",
            ChannelId::Hypopnea => "hypopnea",
            ChannelId::UnclassifiedApnea => "unclassified_apnea",
            ChannelId::MixedApnea => "mixed_apnea",
            ChannelId::Rera => "rera",
            ChannelId::FlowLimitation => "flow_limitation",
            ChannelId::MaskOn => "mask_on",
        }
    }

    /// The sample kind this signal always has.
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelId::ObstructiveApnea
            | ChannelId::CentralApnea
            | ChannelId::Hypopnea
            | ChannelId::UnclassifiedApnea
            | ChannelId::MixedApnea
            | ChannelId::Rera
            | ChannelId::FlowLimitation => ChannelKind::Event,
            ChannelId::MaskOn => ChannelKind::Flag,
            _ => ChannelKind::Waveform,
        }
    }

    /// Stable one-byte code used in stored blobs.
    pub fn code(&self) -> u8 {
        Self::ALL.iter().position(|c| c == self).unwrap_or(0) as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

fn default_gain() -> f64 {
    1.0
}

/// Format-layer description of one channel inside one file type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub kind: ChannelKind,
    /// Signal label (waveforms) or annotation text (events/flags) in the source file
    pub label: String,
    /// Nominal rate in Hz, waveforms only
    #[serde(default)]
    pub sample_rate: Option<f64>,
    #[serde(default)]
    pub unit: String,
    /// Quantization step used by the encoder
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub offset: f64,
    /// Value used for events recorded with zero or unknown duration
    #[serde(default)]
    pub default_value: Option<f64>,
    /// Annotation text that switches a flag channel off
    #[serde(default)]
    pub off_label: Option<String>,
}

impl ChannelDescriptor {
    pub fn waveform(id: ChannelId, label: &str, sample_rate: f64, unit: &str, gain: f64, offset: f64) -> Self {
        ChannelDescriptor {
            id,
            kind: ChannelKind::Waveform,
            label: label.to_string(),
            sample_rate: Some(sample_rate),
            unit: unit.to_string(),
            gain,
            offset,
            default_value: None,
            off_label: None,
        }
    }

    pub fn event(id: ChannelId, label: &str, default_value: Option<f64>) -> Self {
        ChannelDescriptor {
            id,
            kind: ChannelKind::Event,
            label: label.to_string(),
            sample_rate: None,
            unit: "s".to_string(),
            gain: 1.0,
            offset: 0.0,
            default_value,
            off_label: None,
        }
    }

    pub fn flag(id: ChannelId, on_label: &str, off_label: &str) -> Self {
        ChannelDescriptor {
            id,
            kind: ChannelKind::Flag,
            label: on_label.to_string(),
            sample_rate: None,
            unit: String::new(),
            gain: 1.0,
            offset: 0.0,
            default_value: None,
            off_label: Some(off_label.to_string()),
        }
    }

    /// Rejects descriptors the encoder or decoder could not honour.
    pub fn validate(&self) -> Result<()> {
        if self.kind != self.id.kind() {
            return Err(IngestError::InvalidDescriptor(format!(
                "{} declared as {:?} but is a {:?} channel",
                self.id.name(),
                self.kind,
                self.id.kind()
            )));
        }
        if self.label.trim().is_empty() {
            return Err(IngestError::InvalidDescriptor(format!("{} has an empty label", self.id.name())));
        }
        if !self.gain.is_finite() || self.gain <= 0.0 {
            return Err(IngestError::InvalidDescriptor(format!(
                "{} gain must be positive, got {}",
                self.id.name(),
                self.gain
            )));
        }
        if !self.offset.is_finite() {
            return Err(IngestError::InvalidDescriptor(format!("{} offset is not finite", self.id.name())));
        }
        if self.kind == ChannelKind::Waveform {
            match self.sample_rate {
                Some(rate) if rate.is_finite() && rate > 0.0 => {}
                _ => {
                    return Err(IngestError::InvalidDescriptor(format!(
                        "{} needs a positive sample rate",
                        self.id.name()
                    )))
                }
            }
        }
        Ok(())
    }
}

/// One file type of a recording (e.g. `BRP`) and the channels it carries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileFormat {
    pub suffix: String,
    pub channels: Vec<ChannelDescriptor>,
}

impl FileFormat {
    /// `20240621_013454_BRP.edf` matches suffix `BRP`.
    pub fn matches(&self, file_name: &str) -> bool {
        let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
        stem.rsplit('_')
            .next()
            .map_or(false, |tail| tail.eq_ignore_ascii_case(&self.suffix))
    }
}

/// Contiguous waveform samples; sample `i` is at `start_ms + i * 1000 / rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformRun {
    pub start_ms: i64,
    pub sample_rate: f64,
    pub values: Vec<f64>,
}

impl WaveformRun {
    pub fn timestamp_ms(&self, index: usize) -> i64 {
        self.start_ms + offset_ms(index, self.sample_rate)
    }

    /// Exclusive end of the run.
    pub fn end_ms(&self) -> i64 {
        self.start_ms + offset_ms(self.values.len(), self.sample_rate)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn offset_ms(index: usize, sample_rate: f64) -> i64 {
    (index as f64 * 1000.0 / sample_rate).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventSample {
    pub timestamp_ms: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSample {
    pub timestamp_ms: i64,
    pub value: bool,
}

/// Decoded samples of one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelData {
    Waveform(Vec<WaveformRun>),
    Events(Vec<EventSample>),
    Flags(Vec<FlagSample>),
}

impl ChannelData {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelData::Waveform(_) => ChannelKind::Waveform,
            ChannelData::Events(_) => ChannelKind::Event,
            ChannelData::Flags(_) => ChannelKind::Flag,
        }
    }

    pub fn sample_count(&self) -> usize {
        match self {
            ChannelData::Waveform(runs) => runs.iter().map(|r| r.len()).sum(),
            ChannelData::Events(events) => events.len(),
            ChannelData::Flags(flags) => flags.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    /// Numeric values in time order (waveform values or event values).
    pub fn values(&self) -> Vec<f64> {
        match self {
            ChannelData::Waveform(runs) => runs.iter().flat_map(|r| r.values.iter().copied()).collect(),
            ChannelData::Events(events) => events.iter().map(|e| e.value).collect(),
            ChannelData::Flags(flags) => flags.iter().map(|f| if f.value { 1.0 } else { 0.0 }).collect(),
        }
    }
}

/// A contiguous run of decoded samples from one file for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub source: String,
    pub descriptor: ChannelDescriptor,
    pub start_ms: i64,
    pub end_ms: i64,
    pub data: ChannelData,
}

impl Segment {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionChannel {
    pub descriptor: ChannelDescriptor,
    pub data: ChannelData,
}

/// A reconciled therapy interval. `end_ms > start_ms` always holds for
/// sessions produced by the merger.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub start_ms: i64,
    pub end_ms: i64,
    pub channels: Vec<SessionChannel>,
}

impl Session {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    pub fn therapy_hours(&self) -> f64 {
        self.duration_ms() as f64 / crate::MS_PER_HOUR as f64
    }

    pub fn channel(&self, id: ChannelId) -> Option<&SessionChannel> {
        self.channels.iter().find(|c| c.descriptor.id == id)
    }

    pub fn key(&self, device: &str) -> SessionKey {
        SessionKey {
            device: device.to_string(),
            start_ms: self.start_ms,
        }
    }
}

/// Natural identity of a session: same device and same start instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub device: String,
    pub start_ms: i64,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.start_ms)
    }
}

/// One raw file of a recording.
#[derive(Debug, Clone)]
pub struct RecordingFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// All files sharing one recording timestamp on one device.
#[derive(Debug, Clone)]
pub struct Recording {
    pub device: String,
    pub recording_id: String,
    pub files: Vec<RecordingFile>,
}
