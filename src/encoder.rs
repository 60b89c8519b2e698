//! Compact storage of session channels.
//!
//! Stored blob, little-endian:
//!
//! ```text
//! magic "CPCH" | version u8 | kind u8 | channel u8 |
//! sample_rate f64 | gain f64 | offset f64 | min_value f64 | max_value f64 |
//! sample_count u64 | raw_len u32 | crc32 u32 | payload_len u32 | payload
//! ```
//!
//! The payload is zstd-compressed; `raw_len` and `crc32` describe the
//! uncompressed bytes. Waveforms are quantized to `round((v - offset) / gain)`
//! and stored as zigzag varint deltas after a run table; events and flags
//! store varint timestamp gaps followed by their values.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{IngestError, Result};
use crate::types::{ChannelData, ChannelId, ChannelKind, EventSample, FlagSample, SessionChannel, WaveformRun};
use crate::utils::{read_varint, write_varint, zigzag_decode, zigzag_encode};

pub const BLOB_MAGIC: &[u8; 4] = b"CPCH";
pub const BLOB_VERSION: u8 = 1;
pub const BLOB_HEADER_LEN: usize = 4 + 3 + 5 * 8 + 8 + 3 * 4;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChannel {
    pub channel: ChannelId,
    pub kind: ChannelKind,
    /// Hz for waveforms, 0 for irregular channels
    pub sample_rate: f64,
    pub gain: f64,
    pub offset: f64,
    /// Observed range after quantization
    pub min_value: f64,
    pub max_value: f64,
    pub sample_count: u64,
    pub raw_len: u32,
    pub crc32: u32,
    pub payload: Vec<u8>,
}

/// Encodes one session channel with the given zstd level.
pub fn encode_channel(channel: &SessionChannel, level: i32) -> Result<EncodedChannel> {
    let descriptor = &channel.descriptor;
    if channel.data.kind() != descriptor.kind {
        return Err(IngestError::InvalidDescriptor(format!(
            "{} data is {:?}, descriptor says {:?}",
            descriptor.id.name(),
            channel.data.kind(),
            descriptor.kind
        )));
    }

    let mut raw = Vec::new();
    let (sample_rate, gain, offset, range) = match &channel.data {
        ChannelData::Waveform(runs) => {
            let sample_rate = match runs.first() {
                Some(first) => {
                    if runs.iter().any(|r| r.sample_rate != first.sample_rate) {
                        return Err(IngestError::InvalidFormat(format!(
                            "{} runs have differing sample rates",
                            descriptor.id.name()
                        )));
                    }
                    first.sample_rate
                }
                None => descriptor.sample_rate.unwrap_or(0.0),
            };
            let range = write_waveform(&mut raw, runs, descriptor.gain, descriptor.offset);
            (sample_rate, descriptor.gain, descriptor.offset, range)
        }
        ChannelData::Events(events) => {
            write_timestamps(&mut raw, events.iter().map(|e| e.timestamp_ms))?;
            for event in events {
                raw.write_f64::<LittleEndian>(event.value)?;
            }
            let range = value_range(events.iter().map(|e| e.value));
            (0.0, 1.0, 0.0, range)
        }
        ChannelData::Flags(flags) => {
            write_timestamps(&mut raw, flags.iter().map(|f| f.timestamp_ms))?;
            raw.extend(flags.iter().map(|f| f.value as u8));
            let range = value_range(flags.iter().map(|f| if f.value { 1.0 } else { 0.0 }));
            (0.0, 1.0, 0.0, range)
        }
    };

    let raw_len = u32::try_from(raw.len())
        .map_err(|_| IngestError::InvalidFormat(format!("{} payload too large", descriptor.id.name())))?;
    let crc32 = crc32fast::hash(&raw);
    let payload = zstd::bulk::compress(&raw, level)?;

    tracing::debug!(
        channel = descriptor.id.name(),
        samples = channel.data.sample_count(),
        raw_len,
        compressed = payload.len(),
        "encoded channel"
    );

    let (min_value, max_value) = range.unwrap_or((0.0, 0.0));
    Ok(EncodedChannel {
        channel: descriptor.id,
        kind: descriptor.kind,
        sample_rate,
        gain,
        offset,
        min_value,
        max_value,
        sample_count: channel.data.sample_count() as u64,
        raw_len,
        crc32,
        payload,
    })
}

/// Run table, then deltas of the quantized values across all runs.
fn write_waveform(raw: &mut Vec<u8>, runs: &[WaveformRun], gain: f64, offset: f64) -> Option<(f64, f64)> {
    write_varint(raw, runs.len() as u64);
    for run in runs {
        write_varint(raw, zigzag_encode(run.start_ms));
        write_varint(raw, run.values.len() as u64);
    }

    let mut previous = 0i64;
    let mut range: Option<(i64, i64)> = None;
    for &value in runs.iter().flat_map(|r| r.values.iter()) {
        let quantized = ((value - offset) / gain).round() as i64;
        write_varint(raw, zigzag_encode(quantized.wrapping_sub(previous)));
        previous = quantized;
        range = Some(match range {
            Some((lo, hi)) => (lo.min(quantized), hi.max(quantized)),
            None => (quantized, quantized),
        });
    }

    range.map(|(lo, hi)| (lo as f64 * gain + offset, hi as f64 * gain + offset))
}

fn write_timestamps(raw: &mut Vec<u8>, timestamps: impl ExactSizeIterator<Item = i64>) -> Result<()> {
    write_varint(raw, timestamps.len() as u64);
    let mut previous: Option<i64> = None;
    for ts in timestamps {
        match previous {
            None => write_varint(raw, zigzag_encode(ts)),
            Some(p) if ts >= p => write_varint(raw, (ts - p) as u64),
            Some(p) => {
                return Err(IngestError::InvalidFormat(format!("timestamp {} precedes {}", ts, p)));
            }
        }
        previous = Some(ts);
    }
    Ok(())
}

fn value_range(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values.fold(None, |acc, v| match acc {
        Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
        None => Some((v, v)),
    })
}

impl EncodedChannel {
    /// Reconstructs the samples. Any inconsistency is a `DecodeIntegrity`
    /// error for this channel.
    pub fn decode(&self) -> Result<ChannelData> {
        let raw = zstd::bulk::decompress(&self.payload, self.raw_len as usize)
            .map_err(|e| IngestError::integrity(format!("{}: zstd: {}", self.channel.name(), e)))?;
        if raw.len() != self.raw_len as usize {
            return Err(IngestError::integrity(format!(
                "{}: payload is {} bytes, header says {}",
                self.channel.name(),
                raw.len(),
                self.raw_len
            )));
        }
        if crc32fast::hash(&raw) != self.crc32 {
            return Err(IngestError::integrity(format!("{}: crc mismatch", self.channel.name())));
        }

        let mut pos = 0usize;
        let data = match self.kind {
            ChannelKind::Waveform => ChannelData::Waveform(self.read_waveform(&raw, &mut pos)?),
            ChannelKind::Event => {
                let timestamps = self.read_timestamps(&raw, &mut pos)?;
                let mut events = Vec::with_capacity(timestamps.len());
                for timestamp_ms in timestamps {
                    let bytes = raw
                        .get(pos..pos + 8)
                        .ok_or_else(|| self.truncated("event values"))?;
                    let value = f64::from_le_bytes(bytes.try_into().map_err(|_| self.truncated("event values"))?);
                    pos += 8;
                    events.push(EventSample { timestamp_ms, value });
                }
                ChannelData::Events(events)
            }
            ChannelKind::Flag => {
                let timestamps = self.read_timestamps(&raw, &mut pos)?;
                let mut flags = Vec::with_capacity(timestamps.len());
                for timestamp_ms in timestamps {
                    let byte = *raw.get(pos).ok_or_else(|| self.truncated("flag values"))?;
                    pos += 1;
                    flags.push(FlagSample { timestamp_ms, value: byte != 0 });
                }
                ChannelData::Flags(flags)
            }
        };

        if pos != raw.len() {
            return Err(IngestError::integrity(format!(
                "{}: {} trailing payload bytes",
                self.channel.name(),
                raw.len() - pos
            )));
        }
        if data.sample_count() as u64 != self.sample_count {
            return Err(IngestError::integrity(format!(
                "{}: decoded {} samples, header says {}",
                self.channel.name(),
                data.sample_count(),
                self.sample_count
            )));
        }
        Ok(data)
    }

    fn read_waveform(&self, raw: &[u8], pos: &mut usize) -> Result<Vec<WaveformRun>> {
        let run_count = read_varint(raw, pos).ok_or_else(|| self.truncated("run table"))?;
        if run_count > raw.len() as u64 {
            return Err(self.truncated("run table"));
        }
        let mut table = Vec::with_capacity(run_count as usize);
        for _ in 0..run_count {
            let start_ms = zigzag_decode(read_varint(raw, pos).ok_or_else(|| self.truncated("run table"))?);
            let len = read_varint(raw, pos).ok_or_else(|| self.truncated("run table"))?;
            if len > self.sample_count {
                return Err(IngestError::integrity(format!("{}: run longer than channel", self.channel.name())));
            }
            table.push((start_ms, len as usize));
        }

        let mut previous = 0i64;
        let mut runs = Vec::with_capacity(table.len());
        for (start_ms, len) in table {
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                let delta = zigzag_decode(read_varint(raw, pos).ok_or_else(|| self.truncated("samples"))?);
                previous = previous.wrapping_add(delta);
                values.push(previous as f64 * self.gain + self.offset);
            }
            runs.push(WaveformRun { start_ms, sample_rate: self.sample_rate, values });
        }
        Ok(runs)
    }

    fn read_timestamps(&self, raw: &[u8], pos: &mut usize) -> Result<Vec<i64>> {
        let count = read_varint(raw, pos).ok_or_else(|| self.truncated("timestamps"))?;
        if count > self.sample_count {
            return Err(IngestError::integrity(format!("{}: too many timestamps", self.channel.name())));
        }
        let mut timestamps = Vec::with_capacity(count as usize);
        let mut previous: Option<i64> = None;
        for _ in 0..count {
            let v = read_varint(raw, pos).ok_or_else(|| self.truncated("timestamps"))?;
            let ts = match previous {
                None => zigzag_decode(v),
                Some(p) => p
                    .checked_add(v as i64)
                    .ok_or_else(|| IngestError::integrity(format!("{}: timestamp overflow", self.channel.name())))?,
            };
            timestamps.push(ts);
            previous = Some(ts);
        }
        Ok(timestamps)
    }

    fn truncated(&self, what: &str) -> IngestError {
        IngestError::integrity(format!("{}: truncated {}", self.channel.name(), what))
    }

    /// Serializes header and payload into the stored blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| IngestError::InvalidFormat("compressed payload too large".to_string()))?;

        let mut out = Vec::with_capacity(BLOB_HEADER_LEN + self.payload.len());
        out.extend_from_slice(BLOB_MAGIC);
        out.write_u8(BLOB_VERSION)?;
        out.write_u8(self.kind.code())?;
        out.write_u8(self.channel.code())?;
        out.write_f64::<LittleEndian>(self.sample_rate)?;
        out.write_f64::<LittleEndian>(self.gain)?;
        out.write_f64::<LittleEndian>(self.offset)?;
        out.write_f64::<LittleEndian>(self.min_value)?;
        out.write_f64::<LittleEndian>(self.max_value)?;
        out.write_u64::<LittleEndian>(self.sample_count)?;
        out.write_u32::<LittleEndian>(self.raw_len)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(payload_len)?;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parses a stored blob. The payload itself is only checked by
    /// [`decode`](Self::decode).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOB_HEADER_LEN {
            return Err(IngestError::integrity(format!("blob too short ({} bytes)", bytes.len())));
        }
        if &bytes[0..4] != BLOB_MAGIC {
            return Err(IngestError::integrity("bad blob magic"));
        }

        let mut cursor = Cursor::new(&bytes[4..]);
        let header = |e: std::io::Error| IngestError::integrity(format!("blob header: {}", e));

        let version = cursor.read_u8().map_err(header)?;
        if version != BLOB_VERSION {
            return Err(IngestError::integrity(format!("unsupported blob version {}", version)));
        }
        let kind_code = cursor.read_u8().map_err(header)?;
        let kind = ChannelKind::from_code(kind_code)
            .ok_or_else(|| IngestError::integrity(format!("unknown channel kind {}", kind_code)))?;
        let channel_code = cursor.read_u8().map_err(header)?;
        let channel = ChannelId::from_code(channel_code)
            .ok_or_else(|| IngestError::integrity(format!("unknown channel {}", channel_code)))?;
        if channel.kind() != kind {
            return Err(IngestError::integrity(format!("{} stored as {:?}", channel.name(), kind)));
        }

        let sample_rate = cursor.read_f64::<LittleEndian>().map_err(header)?;
        let gain = cursor.read_f64::<LittleEndian>().map_err(header)?;
        let offset = cursor.read_f64::<LittleEndian>().map_err(header)?;
        let min_value = cursor.read_f64::<LittleEndian>().map_err(header)?;
        let max_value = cursor.read_f64::<LittleEndian>().map_err(header)?;
        let sample_count = cursor.read_u64::<LittleEndian>().map_err(header)?;
        let raw_len = cursor.read_u32::<LittleEndian>().map_err(header)?;
        let crc32 = cursor.read_u32::<LittleEndian>().map_err(header)?;
        let payload_len = cursor.read_u32::<LittleEndian>().map_err(header)? as usize;

        let remaining = bytes.len() - BLOB_HEADER_LEN;
        if payload_len != remaining {
            return Err(IngestError::integrity(format!(
                "payload length {} but {} bytes follow the header",
                payload_len, remaining
            )));
        }
        let mut payload = Vec::with_capacity(payload_len);
        cursor.read_to_end(&mut payload).map_err(header)?;

        Ok(EncodedChannel {
            channel,
            kind,
            sample_rate,
            gain,
            offset,
            min_value,
            max_value,
            sample_count,
            raw_len,
            crc32,
            payload,
        })
    }
}
