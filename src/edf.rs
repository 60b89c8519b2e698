//! EDF+ record layout.
//!
//! ResMed devices write every file of a recording (BRP, PLD, SA2, EVE, CSL)
//! as EDF+: a 256-byte ASCII main header, 256 bytes of header per signal,
//! then fixed-size data records holding 16-bit little-endian samples for
//! every signal in turn. Signals labelled `EDF Annotations` carry TALs
//! (time-stamped annotation lists) instead of samples; the first TAL of
//! each record is its time-keeping onset.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::decoder::{reconcile_length, retain_monotonic, DecodedFile, SegmentDecoder};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{IngestError, Result};
use crate::types::{
    ChannelData, ChannelDescriptor, ChannelKind, EventSample, FlagSample, Segment, WaveformRun,
};
use crate::utils::{
    atof_nonlocalized, atoi_nonlocalized, datetime_to_ms, edf_time_to_ms, is_integer_number,
    is_number, parse_edf_time,
};
use crate::{EDF_MAX_SIGNALS, EDF_TIME_DIMENSION};

pub const EDF_HEADER_SIZE: usize = 256;
pub const ANNOTATION_LABEL: &str = "EDF Annotations";

/// TAL separators
const TAL_DURATION: u8 = 0x15;
const TAL_TEXT: u8 = 0x14;
/// TAL onsets beyond this (about 317 years, in 100ns units) are rejected
const MAX_TAL_ONSET: i64 = 10_000_000_000 * EDF_TIME_DIMENSION;

/// Header parameters of one ordinary (non-annotation) signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalParam {
    pub label: String,
    pub physical_max: f64,
    pub physical_min: f64,
    pub digital_max: i32,
    pub digital_min: i32,
    pub samples_per_record: i32,
    pub physical_dimension: String,
    pub prefilter: String,
    pub transducer: String,
}

impl SignalParam {
    /// 计算物理值转换参数
    pub fn bit_value(&self) -> f64 {
        (self.physical_max - self.physical_min) / (self.digital_max - self.digital_min) as f64
    }

    /// 计算偏移量
    pub fn offset(&self) -> f64 {
        self.physical_max / self.bit_value() - self.digital_max as f64
    }

    /// 将数字值转换为物理值
    pub fn to_physical(&self, digital_value: i32) -> f64 {
        self.bit_value() * (self.offset() + digital_value as f64)
    }

    /// 将物理值转换为数字值
    pub fn to_digital(&self, physical_value: f64) -> i32 {
        let digital = (physical_value / self.bit_value()) - self.offset();
        digital.round() as i32
    }
}

/// One annotation read from a TAL, times in 100ns units relative to the
/// header start time.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub onset: i64,
    /// -1 when the TAL carries no duration
    pub duration: i64,
    pub description: String,
    /// Data record the TAL was found in
    pub record: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdfHeader {
    pub signals: Vec<SignalParam>,
    pub start: NaiveDateTime,
    /// `-1` when the writer did not know the count
    pub datarecords_in_file: i64,
    /// 数据记录持续时间（100纳秒为单位）
    pub datarecord_duration: i64,
    /// `EDF+C` (true) or `EDF+D`
    pub continuous: bool,
    pub patient: String,
    pub recording: String,
}

#[derive(Debug, Clone)]
struct SignalInfo {
    buffer_offset: usize,
    samples_per_record: usize,
    is_annotation: bool,
    /// Index into `EdfHeader::signals` for ordinary signals
    param_index: Option<usize>,
}

/// A parsed EDF+ buffer. Decoding never copies the sample area.
pub struct EdfFile<'a> {
    source: String,
    bytes: &'a [u8],
    header: EdfHeader,
    signal_info: Vec<SignalInfo>,
    header_size: usize,
    record_size: usize,
}

impl<'a> EdfFile<'a> {
    /// Parses and validates the header. Any failure here makes the whole
    /// file unusable.
    pub fn parse(source: &str, bytes: &'a [u8]) -> Result<Self> {
        let err = |reason: String| IngestError::header(source, reason);

        if bytes.len() < EDF_HEADER_SIZE {
            return Err(err(format!("file too short for EDF header ({} bytes)", bytes.len())));
        }
        let main_header = &bytes[..EDF_HEADER_SIZE];
        let field = |start: usize, end: usize| String::from_utf8_lossy(&main_header[start..end]).to_string();

        // 验证EDF版本
        let version = field(0, 8);
        if version.trim() != "0" {
            return Err(err(format!("unsupported version field '{}'", version.trim())));
        }

        // 解析信号数量
        let signals_str = field(252, 256);
        if !is_integer_number(&signals_str) {
            return Err(err(format!("invalid signal count '{}'", signals_str.trim())));
        }
        let total_signal_count = atoi_nonlocalized(&signals_str);
        if total_signal_count < 1 || total_signal_count > EDF_MAX_SIGNALS as i64 {
            return Err(err(format!("invalid number of signals: {}", total_signal_count)));
        }
        let total_signal_count = total_signal_count as usize;

        // 验证头部大小
        let header_size = (total_signal_count + 1) * EDF_HEADER_SIZE;
        if atoi_nonlocalized(&field(184, 192)) != header_size as i64 {
            return Err(err("header size field disagrees with signal count".to_string()));
        }
        if bytes.len() < header_size {
            return Err(err(format!("file truncated inside signal headers ({} < {})", bytes.len(), header_size)));
        }

        // 检查EDF+标识
        let reserved = field(192, 236);
        let continuous = if reserved.starts_with("EDF+C") {
            true
        } else if reserved.starts_with("EDF+D") {
            false
        } else {
            return Err(err(format!("not an EDF+ file (reserved field '{}')", reserved.trim())));
        };

        let start = Self::parse_datetime(&field(168, 176), &field(176, 184))
            .ok_or_else(|| err("invalid start date/time".to_string()))?;

        // 解析数据记录信息
        let datarecords_str = field(236, 244);
        if !is_integer_number(&datarecords_str) {
            return Err(err(format!("invalid data record count '{}'", datarecords_str.trim())));
        }
        let datarecords = atoi_nonlocalized(&datarecords_str);

        let duration_str = field(244, 252);
        let datarecord_duration = parse_edf_time(&duration_str)
            .map_err(|_| err(format!("invalid record duration '{}'", duration_str.trim())))?;
        if datarecord_duration <= 0 {
            return Err(err("record duration must be positive".to_string()));
        }

        let (signals, signal_info, record_size) =
            Self::parse_signals(&bytes[EDF_HEADER_SIZE..header_size], total_signal_count)
                .map_err(err)?;
        if record_size == 0 {
            return Err(err("data records have zero size".to_string()));
        }

        let header = EdfHeader {
            signals,
            start,
            datarecords_in_file: datarecords,
            datarecord_duration,
            continuous,
            patient: field(8, 88).trim().to_string(),
            recording: field(88, 168).trim().to_string(),
        };

        Ok(EdfFile {
            source: source.to_string(),
            bytes,
            header,
            signal_info,
            header_size,
            record_size,
        })
    }

    pub fn header(&self) -> &EdfHeader {
        &self.header
    }

    pub fn start_ms(&self) -> i64 {
        datetime_to_ms(self.header.start)
    }

    /// Full records present in the buffer, reconciled with the declared
    /// count. A trailing partial record is reported and ignored.
    pub fn usable_records(&self, diagnostics: &mut Diagnostics) -> usize {
        let body = self.bytes.len() - self.header_size;
        let full = body / self.record_size;
        let remainder = body % self.record_size;

        if remainder > 0 {
            diagnostics.push(
                DiagnosticKind::MalformedRecord { record: full },
                &self.source,
                None,
                format!("truncated data record: {} of {} bytes", remainder, self.record_size),
            );
        }

        let declared = self.header.datarecords_in_file;
        if declared < 0 {
            full
        } else {
            full.min(declared as usize)
        }
    }

    /// Time-keeping onset of each record (100ns units from header start);
    /// `None` marks a record whose time-keeping TAL is unreadable.
    pub fn record_onsets(&self, records: usize, diagnostics: &mut Diagnostics) -> Vec<Option<i64>> {
        let first_annotation = self.signal_info.iter().position(|s| s.is_annotation);
        let Some(annotation_signal) = first_annotation else {
            // 没有注释信号时按连续记录推算
            return (0..records)
                .map(|r| {
                    (r as i64)
                        .checked_mul(self.header.datarecord_duration)
                        .filter(|onset| *onset <= MAX_TAL_ONSET)
                })
                .collect();
        };

        (0..records)
            .map(|record| {
                let tal_bytes = self.signal_bytes(record, annotation_signal);
                let onset = tal_bytes
                    .split(|&b| b == 0)
                    .find(|tal| !tal.is_empty())
                    .and_then(|tal| parse_tal(tal).ok())
                    .map(|(onset, _, _)| onset);
                if onset.is_none() {
                    diagnostics.push(
                        DiagnosticKind::MalformedRecord { record },
                        &self.source,
                        None,
                        "missing or unreadable time-keeping annotation",
                    );
                }
                onset
            })
            .collect()
    }

    /// All non-time-keeping annotations of readable records, in file order.
    pub fn annotations(&self, onsets: &[Option<i64>], diagnostics: &mut Diagnostics) -> Vec<Annotation> {
        let mut annotations = Vec::new();

        for (record, onset) in onsets.iter().enumerate() {
            if onset.is_none() {
                continue;
            }
            let mut first_tal_seen = false;
            for (signal, info) in self.signal_info.iter().enumerate() {
                if !info.is_annotation {
                    continue;
                }
                for tal in self.signal_bytes(record, signal).split(|&b| b == 0) {
                    if tal.is_empty() {
                        continue;
                    }
                    // 第一个TAL是时间戳记录
                    if !first_tal_seen {
                        first_tal_seen = true;
                        continue;
                    }
                    match parse_tal(tal) {
                        Ok((onset, duration, texts)) => {
                            for description in texts {
                                annotations.push(Annotation { onset, duration, description, record });
                            }
                        }
                        Err(reason) => diagnostics.push(
                            DiagnosticKind::MalformedRecord { record },
                            &self.source,
                            None,
                            format!("unreadable annotation: {}", reason),
                        ),
                    }
                }
            }
        }

        annotations
    }

    /// Interval covered by the readable records, in epoch milliseconds.
    pub fn covered_interval(&self, onsets: &[Option<i64>]) -> (i64, i64) {
        let base = self.start_ms();
        let first = onsets.iter().flatten().next().copied().unwrap_or(0);
        let last_end = onsets
            .iter()
            .flatten()
            .map(|o| o + self.header.datarecord_duration)
            .max()
            .unwrap_or(first);
        (base + edf_time_to_ms(first), base + edf_time_to_ms(last_end))
    }

    /// Decodes one waveform channel into runs. Runs break at unreadable
    /// records and at time-keeping discontinuities.
    pub fn decode_waveform(
        &self,
        descriptor: &ChannelDescriptor,
        onsets: &[Option<i64>],
        diagnostics: &mut Diagnostics,
    ) -> Vec<Segment> {
        let Some(signal) = self.find_signal(&descriptor.label) else {
            tracing::debug!(source = %self.source, label = %descriptor.label, "signal not present");
            return Vec::new();
        };
        let info = &self.signal_info[signal];
        let Some(param) = info.param_index.map(|i| &self.header.signals[i]) else {
            return Vec::new();
        };
        let spr = info.samples_per_record;
        if spr == 0 {
            return Vec::new();
        }

        // 校验声明的样本数与实际缓冲区长度
        let body_records = (self.bytes.len() - self.header_size) / self.record_size;
        let declared = self.header.datarecords_in_file;
        let usable = if declared >= 0 {
            reconcile_length(
                declared * spr as i64,
                (body_records * spr) as i64,
                &self.source,
                descriptor.id,
                diagnostics,
            ) as usize
                / spr
        } else {
            body_records
        };

        let record_secs = self.header.datarecord_duration as f64 / EDF_TIME_DIMENSION as f64;
        let sample_rate = spr as f64 / record_secs;
        if let Some(nominal) = descriptor.sample_rate {
            if (nominal - sample_rate).abs() > 1e-9 {
                tracing::debug!(
                    source = %self.source,
                    channel = descriptor.id.name(),
                    nominal,
                    actual = sample_rate,
                    "sample rate differs from descriptor, using file rate"
                );
            }
        }

        let base_ms = self.start_ms();
        let mut segments = Vec::new();
        let mut current: Option<WaveformRun> = None;
        let mut expected_onset: Option<i64> = None;

        for (record, onset) in onsets.iter().enumerate().take(usable.min(onsets.len())) {
            let Some(onset) = *onset else {
                // 跳过损坏的记录，断开当前连续段
                if let Some(run) = current.take() {
                    segments.push(self.run_segment(descriptor, run));
                }
                expected_onset = None;
                continue;
            };

            let contiguous = expected_onset.map_or(false, |e| (e - onset).abs() < EDF_TIME_DIMENSION / 1000);
            if !contiguous {
                if let Some(run) = current.take() {
                    segments.push(self.run_segment(descriptor, run));
                }
                current = Some(WaveformRun {
                    start_ms: base_ms + edf_time_to_ms(onset),
                    sample_rate,
                    values: Vec::new(),
                });
            }

            let bytes = self.signal_bytes(record, signal);
            if let Some(run) = current.as_mut() {
                run.values.extend(bytes.chunks_exact(2).map(|pair| {
                    // 转换为有符号16位整数（小端序）并限制范围
                    let digital = i16::from_le_bytes([pair[0], pair[1]]) as i32;
                    param.to_physical(digital.clamp(param.digital_min, param.digital_max))
                }));
            }
            expected_onset = Some(onset + self.header.datarecord_duration);
        }

        if let Some(run) = current.take() {
            segments.push(self.run_segment(descriptor, run));
        }
        segments
    }

    /// Decodes an event or flag channel from the annotations.
    pub fn decode_marks(
        &self,
        descriptor: &ChannelDescriptor,
        annotations: &[Annotation],
        interval: (i64, i64),
        diagnostics: &mut Diagnostics,
    ) -> Segment {
        let base_ms = self.start_ms();
        let (start_ms, end_ms) = interval;
        let matches = |text: &str, label: &str| text.trim().eq_ignore_ascii_case(label.trim());

        let mut stamped: Vec<(i64, &Annotation, bool)> = Vec::new();
        for annotation in annotations {
            let on = matches(&annotation.description, &descriptor.label);
            let off = descriptor
                .off_label
                .as_deref()
                .map_or(false, |label| matches(&annotation.description, label));
            if !on && !off {
                continue;
            }
            let timestamp_ms = base_ms + edf_time_to_ms(annotation.onset);
            if timestamp_ms < start_ms || timestamp_ms > end_ms {
                diagnostics.push(
                    DiagnosticKind::MalformedRecord { record: annotation.record },
                    &self.source,
                    Some(descriptor.id),
                    format!("annotation '{}' outside recorded interval", annotation.description),
                );
                continue;
            }
            stamped.push((timestamp_ms, annotation, on));
        }

        let data = match descriptor.kind {
            ChannelKind::Flag => {
                let flags: Vec<FlagSample> = stamped
                    .into_iter()
                    .map(|(timestamp_ms, _, on)| FlagSample { timestamp_ms, value: on })
                    .collect();
                let flags = retain_monotonic(flags, |f| f.timestamp_ms, &self.source, descriptor.id, diagnostics);
                ChannelData::Flags(flags)
            }
            _ => {
                let events: Vec<EventSample> = stamped
                    .into_iter()
                    .map(|(timestamp_ms, annotation, _)| {
                        let seconds = annotation.duration as f64 / EDF_TIME_DIMENSION as f64;
                        let value = if annotation.duration > 0 {
                            seconds
                        } else {
                            descriptor.default_value.unwrap_or(0.0)
                        };
                        EventSample { timestamp_ms, value }
                    })
                    .collect();
                let events = retain_monotonic(events, |e| e.timestamp_ms, &self.source, descriptor.id, diagnostics);
                ChannelData::Events(events)
            }
        };

        Segment {
            source: self.source.clone(),
            descriptor: descriptor.clone(),
            start_ms,
            end_ms,
            data,
        }
    }

    fn run_segment(&self, descriptor: &ChannelDescriptor, run: WaveformRun) -> Segment {
        Segment {
            source: self.source.clone(),
            descriptor: descriptor.clone(),
            start_ms: run.start_ms,
            end_ms: run.end_ms(),
            data: ChannelData::Waveform(vec![run]),
        }
    }

    fn find_signal(&self, label: &str) -> Option<usize> {
        self.signal_info.iter().position(|info| {
            info.param_index
                .map_or(false, |i| self.header.signals[i].label.eq_ignore_ascii_case(label.trim()))
        })
    }

    fn signal_bytes(&self, record: usize, signal: usize) -> &'a [u8] {
        let info = &self.signal_info[signal];
        let start = self.header_size + record * self.record_size + info.buffer_offset;
        &self.bytes[start..start + info.samples_per_record * 2]
    }

    /// 解析日期时间 "dd.mm.yy" / "hh.mm.ss"
    fn parse_datetime(date_str: &str, time_str: &str) -> Option<NaiveDateTime> {
        let date_parts: Vec<&str> = date_str.trim().split('.').collect();
        let time_parts: Vec<&str> = time_str.trim().split('.').collect();
        if date_parts.len() != 3 || time_parts.len() != 3 {
            return None;
        }
        if !date_parts.iter().chain(time_parts.iter()).all(|p| is_integer_number(p)) {
            return None;
        }

        let day = atoi_nonlocalized(date_parts[0]) as u32;
        let month = atoi_nonlocalized(date_parts[1]) as u32;
        let yy = atoi_nonlocalized(date_parts[2]) as i32;
        let year = if yy > 84 { 1900 + yy } else { 2000 + yy };

        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let time = NaiveTime::from_hms_opt(
            atoi_nonlocalized(time_parts[0]) as u32,
            atoi_nonlocalized(time_parts[1]) as u32,
            atoi_nonlocalized(time_parts[2]) as u32,
        )?;
        Some(date.and_time(time))
    }

    /// 解析信号参数
    fn parse_signals(
        signal_header: &[u8],
        total_signal_count: usize,
    ) -> std::result::Result<(Vec<SignalParam>, Vec<SignalInfo>, usize), String> {
        let mut signals = Vec::new();
        let mut signal_info = Vec::new();
        let mut buffer_offset = 0;

        let field = |block_start: usize, width: usize, i: usize| {
            let start = total_signal_count * block_start + i * width;
            String::from_utf8_lossy(&signal_header[start..start + width]).trim().to_string()
        };

        for i in 0..total_signal_count {
            let label = field(0, 16, i);
            let is_annotation = label == ANNOTATION_LABEL;

            let numeric = [field(104, 8, i), field(112, 8, i)];
            let integers = [field(120, 8, i), field(128, 8, i), field(216, 8, i)];
            if !numeric.iter().all(|s| is_number(s)) || !integers.iter().all(|s| is_integer_number(s)) {
                return Err(format!("signal {} ('{}') has non-numeric header fields", i, label));
            }

            let samples_per_record = atoi_nonlocalized(&integers[2]);
            if samples_per_record < 0 {
                return Err(format!("signal {} has negative samples per record", i));
            }

            let param_index = if is_annotation {
                None
            } else {
                let param = SignalParam {
                    label: label.clone(),
                    physical_min: atof_nonlocalized(&numeric[0]),
                    physical_max: atof_nonlocalized(&numeric[1]),
                    digital_min: atoi_nonlocalized(&integers[0]) as i32,
                    digital_max: atoi_nonlocalized(&integers[1]) as i32,
                    samples_per_record: samples_per_record as i32,
                    transducer: field(16, 80, i),
                    physical_dimension: field(96, 8, i),
                    prefilter: field(136, 80, i),
                };
                if param.physical_min == param.physical_max {
                    return Err(format!("signal '{}': physical min equals physical max", label));
                }
                if param.digital_min >= param.digital_max {
                    return Err(format!("signal '{}': digital min must be below digital max", label));
                }
                signals.push(param);
                Some(signals.len() - 1)
            };

            signal_info.push(SignalInfo {
                buffer_offset,
                samples_per_record: samples_per_record as usize,
                is_annotation,
                param_index,
            });

            // 更新缓冲区偏移（每个样本2字节）
            buffer_offset += samples_per_record as usize * 2;
        }

        Ok((signals, signal_info, buffer_offset))
    }
}

/// Parses one TAL (without its trailing NUL) into onset, duration and the
/// non-empty annotation texts.
pub fn parse_tal(tal: &[u8]) -> std::result::Result<(i64, i64, Vec<String>), String> {
    let mut parts = tal.split(|&b| b == TAL_TEXT);
    let timing = parts.next().ok_or("empty TAL")?;
    if !matches!(timing.first(), Some(b'+') | Some(b'-')) {
        return Err("TAL onset must start with a sign".to_string());
    }

    let timing = std::str::from_utf8(timing).map_err(|_| "TAL timing is not ASCII")?;
    let (onset_str, duration_str) = match timing.split_once(TAL_DURATION as char) {
        Some((onset, duration)) => (onset, Some(duration)),
        None => (timing, None),
    };

    let onset = parse_edf_time(onset_str).map_err(|e| e.to_string())?;
    if onset.abs() > MAX_TAL_ONSET {
        return Err(format!("TAL onset '{}' out of range", onset_str));
    }
    let duration = match duration_str {
        Some(d) if !d.is_empty() => parse_edf_time(d).map_err(|e| e.to_string())?,
        _ => -1,
    };
    if duration > MAX_TAL_ONSET {
        return Err(format!("TAL duration '{}' out of range", duration_str.unwrap_or_default()));
    }

    let texts = parts
        .filter(|t| !t.is_empty())
        .map(|t| String::from_utf8_lossy(t).to_string())
        .collect();

    Ok((onset, duration, texts))
}

/// [`SegmentDecoder`] for EDF+ files.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdfPlusDecoder;

impl SegmentDecoder for EdfPlusDecoder {
    fn decode(
        &self,
        source: &str,
        bytes: &[u8],
        channels: &[ChannelDescriptor],
        diagnostics: &mut Diagnostics,
    ) -> Result<DecodedFile> {
        let file = EdfFile::parse(source, bytes)?;
        let records = file.usable_records(diagnostics);
        let onsets = file.record_onsets(records, diagnostics);
        let interval = file.covered_interval(&onsets);

        let needs_annotations = channels.iter().any(|c| c.kind != ChannelKind::Waveform);
        let annotations = if needs_annotations {
            file.annotations(&onsets, diagnostics)
        } else {
            Vec::new()
        };

        let mut segments = Vec::new();
        for descriptor in channels {
            match descriptor.kind {
                ChannelKind::Waveform => {
                    segments.extend(file.decode_waveform(descriptor, &onsets, diagnostics));
                }
                ChannelKind::Event | ChannelKind::Flag => {
                    segments.push(file.decode_marks(descriptor, &annotations, interval, diagnostics));
                }
            }
        }

        tracing::debug!(
            source,
            records,
            segments = segments.len(),
            continuous = file.header().continuous,
            "decoded EDF+ file"
        );

        Ok(DecodedFile {
            source: source.to_string(),
            start_ms: interval.0,
            end_ms: interval.1,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> SignalParam {
        SignalParam {
            label: "Press.2s".to_string(),
            physical_max: 100.0,
            physical_min: -100.0,
            digital_max: 32767,
            digital_min: -32768,
            samples_per_record: 1,
            physical_dimension: "cmH2O".to_string(),
            prefilter: String::new(),
            transducer: String::new(),
        }
    }

    #[test]
    fn test_physical_digital_conversion() {
        let signal = signal();
        let physical = signal.to_physical(16384);
        assert!((physical - 50.0).abs() < 0.1);
        assert!((signal.to_digital(25.0) - 8192).abs() <= 1);
    }

    #[test]
    fn test_parse_tal() {
        let (onset, duration, texts) = parse_tal(b"+120\x1512.5\x14Obstructive Apnea\x14").unwrap();
        assert_eq!(onset, 1_200_000_000);
        assert_eq!(duration, 125_000_000);
        assert_eq!(texts, vec!["Obstructive Apnea".to_string()]);

        let (onset, duration, texts) = parse_tal(b"+0\x14\x14").unwrap();
        assert_eq!(onset, 0);
        assert_eq!(duration, -1);
        assert!(texts.is_empty());

        assert!(parse_tal(b"12\x14x\x14").is_err());
        assert!(parse_tal(b"+abc\x14x\x14").is_err());
        assert!(parse_tal(b"+99999999999\x14\x14").is_err());
        assert!(parse_tal(b"+5\x15999999999999\x14x\x14").is_err());
        assert!(parse_tal(b"+1.123456\xc3\xa9\x14\x14").is_err());
        assert!(parse_tal(b"+99999999999.5\x14\x14").is_err());
    }

    #[test]
    fn test_parse_datetime() {
        let dt = EdfFile::parse_datetime("21.06.24", "01.34.54").unwrap();
        assert_eq!(dt.to_string(), "2024-06-21 01:34:54");
        let dt = EdfFile::parse_datetime("01.01.85", "00.00.00").unwrap();
        assert_eq!(dt.to_string(), "1985-01-01 00:00:00");
        assert!(EdfFile::parse_datetime("32.01.24", "00.00.00").is_none());
        assert!(EdfFile::parse_datetime("aa.01.24", "00.00.00").is_none());
    }

    #[test]
    fn test_rejects_short_and_non_edf_buffers() {
        assert!(matches!(
            EdfFile::parse("x.edf", b"0       "),
            Err(IngestError::HeaderParse { .. })
        ));

        let mut garbage = vec![b' '; 512];
        garbage[0..8].copy_from_slice(b"1       ");
        assert!(EdfFile::parse("x.edf", &garbage).is_err());
    }
}
