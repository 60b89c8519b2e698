//! Import configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. The format catalog describes which channels each file of
//! a recording carries; the defaults follow the ResMed file layout (BRP
//! waveforms, PLD low-rate signals, SA2 oximetry, EVE events, CSL log).

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::encoder::DEFAULT_COMPRESSION_LEVEL;
use crate::error::{IngestError, Result};
use crate::stats::PeriodType;
use crate::types::{ChannelDescriptor, ChannelId, FileFormat};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Profile the imported days and periods belong to
    pub profile: String,
    /// Segments closer than this merge into one session (mask-off tolerance)
    pub gap_threshold_secs: u64,
    /// Minimum therapy hours for a day to count as used
    pub usage_threshold_hours: f64,
    /// Hour of day at which one therapy day ends and the next begins
    pub day_split_hour: u32,
    /// zstd level for channel blobs
    pub compression_level: i32,
    /// SpO2 readings below this are sentinels, not measurements
    pub spo2_valid_min: f64,
    pub pulse_valid_min: f64,
    pub pulse_valid_max: f64,
    /// Worker threads for decoding; `None` lets rayon decide
    pub worker_threads: Option<usize>,
    /// Rollups recomputed after every import
    pub period_types: Vec<PeriodType>,
    pub formats: Vec<FileFormat>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            profile: "default".to_string(),
            gap_threshold_secs: 300,
            usage_threshold_hours: 4.0,
            day_split_hour: 0,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            spo2_valid_min: 50.0,
            pulse_valid_min: 20.0,
            pulse_valid_max: 250.0,
            worker_threads: None,
            period_types: vec![PeriodType::Weekly, PeriodType::Monthly],
            formats: default_formats(),
        }
    }
}

impl IngestConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: IngestConfig = toml::from_str(text).map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(&path)
            .map_err(|e| IngestError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn gap_threshold_ms(&self) -> i64 {
        self.gap_threshold_secs as i64 * 1000
    }

    pub fn format_for(&self, file_name: &str) -> Option<&FileFormat> {
        self.formats.iter().find(|f| f.matches(file_name))
    }

    /// Checks thresholds and every channel descriptor of the catalog.
    pub fn validate(&self) -> Result<()> {
        if self.day_split_hour > 23 {
            return Err(IngestError::Config(format!("day_split_hour {} out of range", self.day_split_hour)));
        }
        if !(self.usage_threshold_hours >= 0.0) {
            return Err(IngestError::Config("usage_threshold_hours must be non-negative".to_string()));
        }
        if !(-7..=22).contains(&self.compression_level) {
            return Err(IngestError::Config(format!(
                "compression_level {} outside zstd range",
                self.compression_level
            )));
        }
        for format in &self.formats {
            for channel in &format.channels {
                channel.validate()?;
            }
        }
        Ok(())
    }
}

/// ResMed-style catalog. Labels are the EDF signal labels and EVE/CSL
/// annotation texts written by AirSense devices.
pub fn default_formats() -> Vec<FileFormat> {
    vec![
        FileFormat {
            suffix: "BRP".to_string(),
            channels: vec![
                ChannelDescriptor::waveform(ChannelId::Flow, "Flow.40ms", 25.0, "L/s", 0.002, 0.0),
                ChannelDescriptor::waveform(ChannelId::MaskPressure, "Press.40ms", 25.0, "cmH2O", 0.02, 0.0),
            ],
        },
        FileFormat {
            suffix: "PLD".to_string(),
            channels: vec![
                ChannelDescriptor::waveform(ChannelId::Pressure, "Press.2s", 0.5, "cmH2O", 0.02, 0.0),
                ChannelDescriptor::waveform(ChannelId::Leak, "Leak.2s", 0.5, "L/min", 0.02, 0.0),
                ChannelDescriptor::waveform(ChannelId::RespiratoryRate, "RespRate.2s", 0.5, "bpm", 0.2, 0.0),
                ChannelDescriptor::waveform(ChannelId::TidalVolume, "TidVol.2s", 0.5, "L", 0.002, 0.0),
                ChannelDescriptor::waveform(ChannelId::MinuteVentilation, "MinVent.2s", 0.5, "L/min", 0.125, 0.0),
            ],
        },
        FileFormat {
            suffix: "SA2".to_string(),
            channels: vec![
                ChannelDescriptor::waveform(ChannelId::SpO2, "SpO2.1s", 1.0, "%", 1.0, 0.0),
                ChannelDescriptor::waveform(ChannelId::Pulse, "Pulse.1s", 1.0, "bpm", 1.0, 0.0),
            ],
        },
        FileFormat {
            suffix: "EVE".to_string(),
            channels: vec![
                ChannelDescriptor::event(ChannelId::ObstructiveApnea, "Obstructive Apnea", None),
                ChannelDescriptor::event(ChannelId::CentralApnea, "Central Apnea", None),
                ChannelDescriptor::event(ChannelId::Hypopnea, "Hypopnea", Some(10.0)),
                ChannelDescriptor::event(ChannelId::UnclassifiedApnea, "Apnea", None),
                ChannelDescriptor::event(ChannelId::MixedApnea, "Mixed Apnea", None),
                ChannelDescriptor::event(ChannelId::Rera, "Arousal", None),
                ChannelDescriptor::event(ChannelId::FlowLimitation, "Flow Limitation", None),
            ],
        },
        FileFormat {
            suffix: "CSL".to_string(),
            channels: vec![ChannelDescriptor::flag(ChannelId::MaskOn, "Mask On", "Mask Off")],
        },
    ]
}
