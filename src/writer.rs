use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::edf::{SignalParam, ANNOTATION_LABEL, EDF_HEADER_SIZE};
use crate::error::{IngestError, Result};
use crate::utils::{format_edf_time, to_ascii};
use crate::{EDF_MAX_SIGNALS, EDF_TIME_DIMENSION};

/// Minimum TAL area per data record (the EDF+ convention of 120 bytes)
const MIN_ANNOTATION_BYTES: usize = 120;

/// Builds an EDF+ recording in memory.
///
/// Records are appended with [`write_samples`](Self::write_samples) (EDF+C)
/// or [`write_samples_at`](Self::write_samples_at) (any explicit onset makes
/// the file EDF+D). Annotations are collected and distributed to the record
/// covering their onset when the file is finished. The annotation area grows
/// to fit the busiest record, so no description is ever truncated.
///
/// ```rust
/// use cpap_ingest::writer::EdfWriter;
/// use cpap_ingest::edf::{EdfPlusDecoder, SignalParam};
/// use cpap_ingest::decoder::SegmentDecoder;
/// use cpap_ingest::{ChannelDescriptor, ChannelId, Diagnostics};
/// # use cpap_ingest::Result;
/// # fn main() -> Result<()> {
/// let start = chrono::NaiveDate::from_ymd_opt(2024, 6, 21).unwrap().and_hms_opt(22, 0, 0).unwrap();
/// let mut writer = EdfWriter::new(start);
/// writer.add_signal(SignalParam {
///     label: "Press.2s".to_string(),
///     physical_max: 327.67,
///     physical_min: -327.68,
///     digital_max: 32767,
///     digital_min: -32768,
///     samples_per_record: 30,
///     physical_dimension: "cmH2O".to_string(),
///     prefilter: String::new(),
///     transducer: String::new(),
/// })?;
/// writer.set_datarecord_duration(60.0)?;
/// writer.write_samples(&[vec![9.5; 30]])?;
/// writer.add_annotation(12.0, Some(15.0), "Obstructive Apnea")?;
/// let bytes = writer.finish()?;
///
/// let channels = [
///     ChannelDescriptor::waveform(ChannelId::Pressure, "Press.2s", 0.5, "cmH2O", 0.02, 0.0),
///     ChannelDescriptor::event(ChannelId::ObstructiveApnea, "Obstructive Apnea", None),
/// ];
/// let mut diagnostics = Diagnostics::new();
/// let file = EdfPlusDecoder.decode("x_PLD.edf", &bytes, &channels, &mut diagnostics)?;
/// assert_eq!(file.segments.len(), 2);
/// assert!(diagnostics.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct EdfWriter {
    signals: Vec<SignalParam>,
    start: NaiveDateTime,
    datarecord_duration: i64,
    /// (onset in 100ns, samples per signal)
    records: Vec<(i64, Vec<Vec<f64>>)>,
    annotations: Vec<(i64, i64, String)>,
    continuous: bool,
    patient: String,
    recording: String,
}

impl EdfWriter {
    pub fn new(start: NaiveDateTime) -> Self {
        EdfWriter {
            signals: Vec::new(),
            start,
            datarecord_duration: EDF_TIME_DIMENSION,
            records: Vec::new(),
            annotations: Vec::new(),
            continuous: true,
            patient: "X X X X".to_string(),
            recording: "Startdate X X X X".to_string(),
        }
    }

    /// Adds an ordinary signal. All signals must be added before the first
    /// record is written.
    pub fn add_signal(&mut self, signal: SignalParam) -> Result<()> {
        if !self.records.is_empty() {
            return Err(IngestError::InvalidFormat("cannot add signals after writing records".to_string()));
        }
        if self.signals.len() + 1 >= EDF_MAX_SIGNALS {
            return Err(IngestError::InvalidFormat("too many signals".to_string()));
        }
        if signal.label.trim().is_empty() || signal.label.len() > 16 || signal.label.trim() == ANNOTATION_LABEL {
            return Err(IngestError::InvalidFormat(format!("invalid signal label '{}'", signal.label)));
        }
        if signal.samples_per_record < 1 {
            return Err(IngestError::InvalidFormat("samples per record must be positive".to_string()));
        }
        if signal.digital_min >= signal.digital_max
            || signal.digital_min < i16::MIN as i32
            || signal.digital_max > i16::MAX as i32
        {
            return Err(IngestError::InvalidFormat("digital range must fit in 16 bits".to_string()));
        }
        if signal.physical_min == signal.physical_max {
            return Err(IngestError::InvalidFormat("physical min equals physical max".to_string()));
        }
        self.signals.push(signal);
        Ok(())
    }

    /// 设置数据记录持续时间（秒）
    pub fn set_datarecord_duration(&mut self, duration_seconds: f64) -> Result<()> {
        if !self.records.is_empty() {
            return Err(IngestError::InvalidFormat("cannot change record duration after writing records".to_string()));
        }
        if !(duration_seconds > 0.0 && duration_seconds <= 99_999_999.0) {
            return Err(IngestError::InvalidFormat("record duration must be positive".to_string()));
        }
        self.datarecord_duration = (duration_seconds * EDF_TIME_DIMENSION as f64).round() as i64;
        Ok(())
    }

    pub fn set_patient(&mut self, patient: &str) {
        self.patient = to_ascii(patient);
    }

    pub fn set_recording(&mut self, recording: &str) {
        self.recording = to_ascii(recording);
    }

    /// Appends a record directly after the previous one.
    pub fn write_samples(&mut self, samples: &[Vec<f64>]) -> Result<()> {
        let onset = self
            .records
            .last()
            .map_or(0, |(onset, _)| onset + self.datarecord_duration);
        self.push_record(onset, samples)
    }

    /// Appends a record at an explicit onset (seconds from start). A gap
    /// turns the file into EDF+D.
    pub fn write_samples_at(&mut self, onset_seconds: f64, samples: &[Vec<f64>]) -> Result<()> {
        let onset = (onset_seconds * EDF_TIME_DIMENSION as f64).round() as i64;
        if let Some((previous, _)) = self.records.last() {
            if onset < previous + self.datarecord_duration {
                return Err(IngestError::InvalidFormat("record onsets must not overlap".to_string()));
            }
            if onset != previous + self.datarecord_duration {
                self.continuous = false;
            }
        } else if onset != 0 {
            self.continuous = false;
        }
        self.push_record(onset, samples)
    }

    fn push_record(&mut self, onset: i64, samples: &[Vec<f64>]) -> Result<()> {
        if samples.len() != self.signals.len() {
            return Err(IngestError::InvalidFormat("Sample count must match signal count".to_string()));
        }
        // 验证每个信号的样本数
        for (i, signal_samples) in samples.iter().enumerate() {
            let expected = self.signals[i].samples_per_record as usize;
            if signal_samples.len() != expected {
                return Err(IngestError::InvalidFormat(format!(
                    "Signal {} expected {} samples per record, got {}",
                    i,
                    expected,
                    signal_samples.len()
                )));
            }
        }
        self.records.push((onset, samples.to_vec()));
        Ok(())
    }

    pub fn add_annotation(
        &mut self,
        onset_seconds: f64,
        duration_seconds: Option<f64>,
        description: &str,
    ) -> Result<()> {
        if onset_seconds < 0.0 {
            return Err(IngestError::InvalidFormat("Annotation onset cannot be negative".to_string()));
        }
        if duration_seconds.map_or(false, |d| d < 0.0) {
            return Err(IngestError::InvalidFormat("Annotation duration cannot be negative".to_string()));
        }
        if description.is_empty() || description.bytes().any(|b| b == 0x14 || b == 0x15 || b == 0) {
            return Err(IngestError::InvalidFormat(format!("invalid annotation text '{}'", description)));
        }

        let onset = (onset_seconds * EDF_TIME_DIMENSION as f64).round() as i64;
        let duration = duration_seconds
            .map(|d| (d * EDF_TIME_DIMENSION as f64).round() as i64)
            .unwrap_or(-1);
        self.annotations.push((onset, duration, description.to_string()));
        Ok(())
    }

    pub fn annotation_count(&self) -> usize {
        self.annotations.len()
    }

    /// Serializes header, records and annotations.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if self.records.is_empty() {
            return Err(IngestError::InvalidFormat("no data records written".to_string()));
        }
        self.annotations.sort_by_key(|(onset, _, _)| *onset);

        let tals = self.record_tals();
        let annotation_bytes = tals
            .iter()
            .map(|t| t.len())
            .max()
            .unwrap_or(0)
            .max(MIN_ANNOTATION_BYTES);
        let annotation_bytes = annotation_bytes + annotation_bytes % 2;
        let annotation_samples = annotation_bytes / 2;

        let total_signals = self.signals.len() + 1;
        let header_size = (total_signals + 1) * EDF_HEADER_SIZE;
        let sample_bytes: usize = self.signals.iter().map(|s| s.samples_per_record as usize * 2).sum();
        let record_size = sample_bytes + annotation_bytes;

        let mut out = Vec::with_capacity(header_size + record_size * self.records.len());
        out.extend_from_slice(&self.main_header(header_size, total_signals));
        out.extend_from_slice(&self.signal_headers(annotation_samples));

        for ((_, samples), tal) in self.records.iter().zip(tals) {
            for (signal, values) in self.signals.iter().zip(samples) {
                for &physical in values {
                    // 写入为16位小端序
                    let digital = signal
                        .to_digital(physical)
                        .clamp(signal.digital_min, signal.digital_max);
                    out.extend_from_slice(&(digital as i16).to_le_bytes());
                }
            }
            let mut tal = tal;
            tal.resize(annotation_bytes, 0);
            out.extend_from_slice(&tal);
        }

        Ok(out)
    }

    /// TAL bytes per record: time-keeping TAL, then the annotations whose
    /// onset falls in the record (the first record also takes earlier ones,
    /// the last record later ones).
    fn record_tals(&self) -> Vec<Vec<u8>> {
        let mut tals: Vec<Vec<u8>> = self
            .records
            .iter()
            .map(|(onset, _)| {
                let mut tal = format_edf_time(*onset).into_bytes();
                tal.extend_from_slice(&[0x14, 0x14, 0x00]);
                tal
            })
            .collect();

        for (onset, duration, description) in &self.annotations {
            let record = self
                .records
                .iter()
                .rposition(|(record_onset, _)| record_onset <= onset)
                .unwrap_or(0);
            let tal = &mut tals[record];
            tal.extend_from_slice(format_edf_time(*onset).as_bytes());
            if *duration >= 0 {
                tal.push(0x15);
                tal.extend_from_slice(format_edf_time(*duration).trim_start_matches('+').as_bytes());
            }
            tal.push(0x14);
            tal.extend_from_slice(description.as_bytes());
            tal.extend_from_slice(&[0x14, 0x00]);
        }

        tals
    }

    fn main_header(&self, header_size: usize, total_signals: usize) -> Vec<u8> {
        let mut header = vec![b' '; EDF_HEADER_SIZE];
        put(&mut header, 0, 8, "0");
        put(&mut header, 8, 80, &self.patient);
        put(&mut header, 88, 80, &self.recording);

        // 开始日期 "dd.mm.yy" / 开始时间 "hh.mm.ss"
        let date = format!("{:02}.{:02}.{:02}", self.start.day(), self.start.month(), self.start.year() % 100);
        let time = format!("{:02}.{:02}.{:02}", self.start.hour(), self.start.minute(), self.start.second());
        put(&mut header, 168, 8, &date);
        put(&mut header, 176, 8, &time);

        put(&mut header, 184, 8, &header_size.to_string());
        put(&mut header, 192, 44, if self.continuous { "EDF+C" } else { "EDF+D" });
        put(&mut header, 236, 8, &self.records.len().to_string());
        put(&mut header, 244, 8, format_edf_time(self.datarecord_duration).trim_start_matches('+'));
        put(&mut header, 252, 4, &total_signals.to_string());
        header
    }

    fn signal_headers(&self, annotation_samples: usize) -> Vec<u8> {
        let annotation = SignalParam {
            label: ANNOTATION_LABEL.to_string(),
            physical_max: 1.0,
            physical_min: -1.0,
            digital_max: 32767,
            digital_min: -32768,
            samples_per_record: annotation_samples as i32,
            physical_dimension: String::new(),
            prefilter: String::new(),
            transducer: String::new(),
        };
        let all: Vec<&SignalParam> = self.signals.iter().chain(std::iter::once(&annotation)).collect();
        let ns = all.len();

        let mut block = vec![b' '; ns * EDF_HEADER_SIZE];
        for (i, signal) in all.iter().enumerate() {
            put(&mut block, i * 16, 16, &signal.label);
            put(&mut block, ns * 16 + i * 80, 80, &to_ascii(&signal.transducer));
            put(&mut block, ns * 96 + i * 8, 8, &to_ascii(&signal.physical_dimension));
            put(&mut block, ns * 104 + i * 8, 8, &format_number(signal.physical_min));
            put(&mut block, ns * 112 + i * 8, 8, &format_number(signal.physical_max));
            put(&mut block, ns * 120 + i * 8, 8, &signal.digital_min.to_string());
            put(&mut block, ns * 128 + i * 8, 8, &signal.digital_max.to_string());
            put(&mut block, ns * 136 + i * 80, 80, &to_ascii(&signal.prefilter));
            put(&mut block, ns * 216 + i * 8, 8, &signal.samples_per_record.to_string());
        }
        block
    }
}

/// Left-aligned, space-padded, truncated ASCII field.
fn put(buf: &mut [u8], start: usize, width: usize, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(width);
    buf[start..start + len].copy_from_slice(&bytes[..len]);
}

/// Physical range values must fit 8 characters.
fn format_number(value: f64) -> String {
    let text = format!("{}", value);
    if text.len() <= 8 {
        return text;
    }
    let mut text = format!("{:.6}", value);
    text.truncate(8);
    text.trim_end_matches('.').to_string()
}
