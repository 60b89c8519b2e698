// Internal utilities for documentation tests and integration tests
// Builds small ResMed-style recordings in memory with EdfWriter

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::edf::SignalParam;
use crate::types::{Recording, RecordingFile};
use crate::writer::EdfWriter;
use crate::Result;

/// 22:00 on 2024-06-21, start of every sample night
pub fn night_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 21)
        .and_then(|d| d.and_hms_opt(22, 0, 0))
        .unwrap_or_default()
}

fn signal(label: &str, dimension: &str, samples_per_record: i32) -> SignalParam {
    SignalParam {
        label: label.to_string(),
        physical_max: 327.67,
        physical_min: -327.68,
        digital_max: 32767,
        digital_min: -32768,
        samples_per_record,
        physical_dimension: dimension.to_string(),
        prefilter: String::new(),
        transducer: String::new(),
    }
}

fn writer(start: NaiveDateTime, signals: Vec<SignalParam>) -> Result<EdfWriter> {
    let mut writer = EdfWriter::new(start);
    writer.set_recording(&format!("Startdate {} X X AirSense_10", start.format("%d-%b-%Y")));
    writer.set_datarecord_duration(60.0)?;
    for signal in signals {
        writer.add_signal(signal)?;
    }
    Ok(writer)
}

/// PLD file: pressure and leak at 0.5 Hz, one-minute records
pub fn pld_file(start: NaiveDateTime, minutes: usize, pressure: f64, leak: f64) -> Result<Vec<u8>> {
    let mut writer = writer(start, vec![signal("Press.2s", "cmH2O", 30), signal("Leak.2s", "L/min", 30)])?;
    for _ in 0..minutes {
        writer.write_samples(&[vec![pressure; 30], vec![leak; 30]])?;
    }
    writer.finish()
}

/// SA2 file: SpO2 and pulse at 1 Hz
pub fn sa2_file(start: NaiveDateTime, minutes: usize, spo2: f64, pulse: f64) -> Result<Vec<u8>> {
    let mut writer = writer(start, vec![signal("SpO2.1s", "%", 60), signal("Pulse.1s", "bpm", 60)])?;
    for _ in 0..minutes {
        writer.write_samples(&[vec![spo2; 60], vec![pulse; 60]])?;
    }
    writer.finish()
}

/// EVE file: annotations only, `(onset seconds, duration seconds, text)`
pub fn eve_file(start: NaiveDateTime, minutes: usize, events: &[(f64, Option<f64>, &str)]) -> Result<Vec<u8>> {
    let mut writer = writer(start, Vec::new())?;
    for _ in 0..minutes {
        writer.write_samples(&[])?;
    }
    for (onset, duration, text) in events {
        writer.add_annotation(*onset, *duration, text)?;
    }
    writer.finish()
}

/// CSL file: mask on at the start, mask off one second before the end
pub fn csl_file(start: NaiveDateTime, minutes: usize) -> Result<Vec<u8>> {
    let mut writer = writer(start, Vec::new())?;
    for _ in 0..minutes {
        writer.write_samples(&[])?;
    }
    writer.add_annotation(0.0, None, "Mask On")?;
    writer.add_annotation((minutes * 60) as f64 - 1.0, None, "Mask Off")?;
    writer.finish()
}

/// Recording id as the device names its files, e.g. `20240621_220000`
pub fn recording_id(start: NaiveDateTime) -> String {
    start.format("%Y%m%d_%H%M%S").to_string()
}

pub fn recording_file(start: NaiveDateTime, suffix: &str, bytes: Vec<u8>) -> RecordingFile {
    RecordingFile {
        name: format!("{}_{}.edf", recording_id(start), suffix),
        bytes,
    }
}

/// A full night: PLD, SA2, EVE and CSL covering `minutes` from `start`,
/// with two obstructive apneas, one hypopnea and one central apnea.
pub fn sample_recording(device: &str, start: NaiveDateTime, minutes: usize) -> Result<Recording> {
    let events = [
        (600.0, Some(14.0), "Obstructive Apnea"),
        (1200.0, Some(22.0), "Obstructive Apnea"),
        (1800.0, Some(12.0), "Hypopnea"),
        (2400.0, Some(11.0), "Central Apnea"),
    ];
    let last = (minutes * 60) as f64;
    let events: Vec<_> = events.into_iter().filter(|(onset, _, _)| *onset < last).collect();

    Ok(Recording {
        device: device.to_string(),
        recording_id: recording_id(start),
        files: vec![
            recording_file(start, "PLD", pld_file(start, minutes, 9.5, 12.0)?),
            recording_file(start, "SA2", sa2_file(start, minutes, 95.0, 62.0)?),
            recording_file(start, "EVE", eve_file(start, minutes, &events)?),
            recording_file(start, "CSL", csl_file(start, minutes)?),
        ],
    })
}

/// Offset helper for building later recordings of the same night
pub fn minutes_after(start: NaiveDateTime, minutes: i64) -> NaiveDateTime {
    start + Duration::minutes(minutes)
}
