use chrono::NaiveDateTime;
use cpap_ingest::decoder::{decode_channel, SegmentDecoder};
use cpap_ingest::doctest_utils::{csl_file, eve_file, night_start, pld_file};
use cpap_ingest::edf::{EdfFile, EdfPlusDecoder, SignalParam};
use cpap_ingest::types::{EventSample, FlagSample};
use cpap_ingest::utils::datetime_to_ms;
use cpap_ingest::writer::EdfWriter;
use cpap_ingest::{ChannelData, ChannelDescriptor, ChannelId, Diagnostics, IngestConfig, IngestError};

fn start_ms() -> i64 {
    datetime_to_ms(night_start())
}

fn pressure() -> ChannelDescriptor {
    ChannelDescriptor::waveform(ChannelId::Pressure, "Press.2s", 0.5, "cmH2O", 0.02, 0.0)
}

fn eve_channels() -> Vec<ChannelDescriptor> {
    IngestConfig::default().format_for("x_EVE.edf").unwrap().channels.clone()
}

fn events(data: &ChannelData) -> &[EventSample] {
    match data {
        ChannelData::Events(events) => events,
        other => panic!("expected events, got {:?}", other.kind()),
    }
}

// 在缓冲区中替换一段等长字节
fn patch(bytes: &mut [u8], from: &[u8], to: &[u8]) {
    assert_eq!(from.len(), to.len());
    let at = bytes
        .windows(from.len())
        .position(|w| w == from)
        .expect("pattern present");
    bytes[at..at + to.len()].copy_from_slice(to);
}

fn single_signal_writer(start: NaiveDateTime) -> EdfWriter {
    let mut writer = EdfWriter::new(start);
    writer
        .add_signal(SignalParam {
            label: "Press.2s".to_string(),
            physical_max: 327.67,
            physical_min: -327.68,
            digital_max: 32767,
            digital_min: -32768,
            samples_per_record: 30,
            physical_dimension: "cmH2O".to_string(),
            prefilter: String::new(),
            transducer: String::new(),
        })
        .unwrap();
    writer.set_datarecord_duration(60.0).unwrap();
    writer
}

#[test]
fn test_waveform_round_trip_through_writer() {
    let bytes = pld_file(night_start(), 10, 8.25, 20.0).unwrap();
    let mut diagnostics = Diagnostics::new();
    let segments = decode_channel(&EdfPlusDecoder, "x_PLD.edf", &bytes, &pressure(), &mut diagnostics).unwrap();

    assert!(diagnostics.is_empty());
    assert_eq!(segments.len(), 1);
    let segment = &segments[0];
    assert_eq!(segment.start_ms, start_ms());
    assert_eq!(segment.end_ms, start_ms() + 600_000);
    assert_eq!(segment.data.sample_count(), 300);
    match &segment.data {
        ChannelData::Waveform(runs) => {
            assert_eq!(runs.len(), 1);
            assert_eq!(runs[0].sample_rate, 0.5);
            assert!(runs[0].values.iter().all(|v| (v - 8.25).abs() < 0.006));
        }
        other => panic!("expected waveform, got {:?}", other.kind()),
    }
}

#[test]
fn test_absent_signal_yields_nothing() {
    let bytes = pld_file(night_start(), 2, 8.0, 20.0).unwrap();
    let flow = ChannelDescriptor::waveform(ChannelId::Flow, "Flow.40ms", 25.0, "L/s", 0.002, 0.0);
    let mut diagnostics = Diagnostics::new();
    let segments = decode_channel(&EdfPlusDecoder, "x_PLD.edf", &bytes, &flow, &mut diagnostics).unwrap();
    assert!(segments.is_empty());
    assert!(diagnostics.is_empty());
}

#[test]
fn test_discontinuous_file_splits_runs() {
    let mut writer = single_signal_writer(night_start());
    writer.write_samples_at(0.0, &[vec![6.0; 30]]).unwrap();
    writer.write_samples_at(60.0, &[vec![6.0; 30]]).unwrap();
    writer.write_samples_at(600.0, &[vec![7.0; 30]]).unwrap();
    let bytes = writer.finish().unwrap();
    assert_eq!(&bytes[192..197], b"EDF+D");

    let mut diagnostics = Diagnostics::new();
    let segments = decode_channel(&EdfPlusDecoder, "x_PLD.edf", &bytes, &pressure(), &mut diagnostics).unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].end_ms - segments[0].start_ms, 120_000);
    assert_eq!(segments[1].start_ms, start_ms() + 600_000);
    assert_eq!(segments[1].data.sample_count(), 30);
}

#[test]
fn test_truncated_file_keeps_complete_records() {
    let mut bytes = pld_file(night_start(), 3, 8.0, 20.0).unwrap();
    bytes.truncate(bytes.len() - 10);

    let mut diagnostics = Diagnostics::new();
    let segments = decode_channel(&EdfPlusDecoder, "x_PLD.edf", &bytes, &pressure(), &mut diagnostics).unwrap();

    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].data.sample_count(), 60);
    assert_eq!(diagnostics.count("MalformedRecord"), 1);
    assert_eq!(diagnostics.count("LengthMismatch"), 1);
}

#[test]
fn test_unreadable_timekeeping_skips_record() {
    let mut bytes = pld_file(night_start(), 3, 8.0, 20.0).unwrap();
    patch(&mut bytes, b"+60\x14\x14\x00", b"x60\x14\x14\x00");

    let mut diagnostics = Diagnostics::new();
    let segments = decode_channel(&EdfPlusDecoder, "x_PLD.edf", &bytes, &pressure(), &mut diagnostics).unwrap();

    assert_eq!(diagnostics.count("MalformedRecord"), 1);
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].start_ms, start_ms());
    assert_eq!(segments[1].start_ms, start_ms() + 120_000);
    assert_eq!(segments.iter().map(|s| s.data.sample_count()).sum::<usize>(), 60);
}

#[test]
fn test_bad_timekeeping_numbers_skip_record() {
    let original: &[u8] = b"+60\x14\x14\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";
    let damaged: [&[u8]; 2] = [
        // 7字节截断处是多字节字符
        b"+1.123456\xc3\xa9\x14\x14\x00\x00\x00",
        // 乘以时间单位后溢出
        b"+9999999999999\x14\x14",
    ];

    for to in damaged {
        let mut bytes = pld_file(night_start(), 3, 8.0, 20.0).unwrap();
        patch(&mut bytes, original, to);

        let mut diagnostics = Diagnostics::new();
        let segments = decode_channel(&EdfPlusDecoder, "x_PLD.edf", &bytes, &pressure(), &mut diagnostics).unwrap();

        assert_eq!(diagnostics.count("MalformedRecord"), 1);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start_ms, start_ms() + 120_000);
        assert_eq!(segments.iter().map(|s| s.data.sample_count()).sum::<usize>(), 60);
    }
}

#[test]
fn test_garbage_is_a_header_error() {
    let mut diagnostics = Diagnostics::new();
    for bytes in [Vec::new(), vec![b'0'; 100], vec![0xFF; 4096]] {
        let result = EdfPlusDecoder.decode("x_PLD.edf", &bytes, &[pressure()], &mut diagnostics);
        assert!(matches!(result, Err(IngestError::HeaderParse { .. })));
    }

    // EDF without the "+" is not accepted either
    let mut bytes = pld_file(night_start(), 1, 8.0, 20.0).unwrap();
    patch(&mut bytes, b"EDF+C", b"     ");
    assert!(EdfFile::parse("x_PLD.edf", &bytes).is_err());
}

#[test]
fn test_events_take_duration_or_default() {
    let bytes = eve_file(
        night_start(),
        5,
        &[
            (30.0, Some(14.0), "Obstructive Apnea"),
            (90.0, None, "Hypopnea"),
            (150.0, Some(25.5), "obstructive apnea"),
            (200.0, Some(0.0), "Central Apnea"),
            (250.0, Some(18.0), "Mixed Apnea"),
        ],
    )
    .unwrap();

    let mut diagnostics = Diagnostics::new();
    let file = EdfPlusDecoder.decode("x_EVE.edf", &bytes, &eve_channels(), &mut diagnostics).unwrap();
    assert!(diagnostics.is_empty());
    assert_eq!(file.start_ms, start_ms());
    assert_eq!(file.end_ms, start_ms() + 300_000);

    let channel = |id: ChannelId| &file.segments.iter().find(|s| s.descriptor.id == id).unwrap().data;
    assert_eq!(
        events(channel(ChannelId::ObstructiveApnea)),
        &[
            EventSample { timestamp_ms: start_ms() + 30_000, value: 14.0 },
            EventSample { timestamp_ms: start_ms() + 150_000, value: 25.5 },
        ]
    );
    assert_eq!(events(channel(ChannelId::Hypopnea))[0].value, 10.0);
    assert_eq!(events(channel(ChannelId::CentralApnea))[0].value, 0.0);
    assert!(events(channel(ChannelId::UnclassifiedApnea)).is_empty());
    assert_eq!(
        events(channel(ChannelId::MixedApnea)),
        &[EventSample { timestamp_ms: start_ms() + 250_000, value: 18.0 }]
    );
}

#[test]
fn test_annotation_outside_file_is_dropped() {
    let bytes = eve_file(
        night_start(),
        2,
        &[(30.0, Some(12.0), "Central Apnea"), (500.0, Some(12.0), "Central Apnea")],
    )
    .unwrap();

    let mut diagnostics = Diagnostics::new();
    let file = EdfPlusDecoder.decode("x_EVE.edf", &bytes, &eve_channels(), &mut diagnostics).unwrap();
    assert_eq!(diagnostics.count("MalformedRecord"), 1);
    let central = file
        .segments
        .iter()
        .find(|s| s.descriptor.id == ChannelId::CentralApnea)
        .unwrap();
    assert_eq!(central.data.sample_count(), 1);
}

#[test]
fn test_event_timestamp_regression_dropped() {
    let mut bytes = eve_file(
        night_start(),
        2,
        &[(30.0, Some(12.0), "Central Apnea"), (70.0, Some(15.0), "Central Apnea")],
    )
    .unwrap();
    // 第二条注释的时间改为早于第一条
    patch(&mut bytes, b"+70\x1515\x14", b"+20\x1515\x14");

    let mut diagnostics = Diagnostics::new();
    let file = EdfPlusDecoder.decode("x_EVE.edf", &bytes, &eve_channels(), &mut diagnostics).unwrap();
    assert_eq!(diagnostics.count("TimestampRegression"), 1);
    let central = file
        .segments
        .iter()
        .find(|s| s.descriptor.id == ChannelId::CentralApnea)
        .unwrap();
    assert_eq!(events(&central.data), &[EventSample { timestamp_ms: start_ms() + 30_000, value: 12.0 }]);
}

#[test]
fn test_mask_flags() {
    let bytes = csl_file(night_start(), 10).unwrap();
    let mask = ChannelDescriptor::flag(ChannelId::MaskOn, "Mask On", "Mask Off");

    let mut diagnostics = Diagnostics::new();
    let segments = decode_channel(&EdfPlusDecoder, "x_CSL.edf", &bytes, &mask, &mut diagnostics).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(
        segments[0].data,
        ChannelData::Flags(vec![
            FlagSample { timestamp_ms: start_ms(), value: true },
            FlagSample { timestamp_ms: start_ms() + 599_000, value: false },
        ])
    );
}

#[test]
fn test_long_annotation_text_is_kept() {
    let text = "Obstructive Apnea detected during REM with desaturation";
    let bytes = eve_file(night_start(), 1, &[(5.0, Some(11.0), text)]).unwrap();
    let file = EdfFile::parse("x_EVE.edf", &bytes).unwrap();

    let mut diagnostics = Diagnostics::new();
    let records = file.usable_records(&mut diagnostics);
    let onsets = file.record_onsets(records, &mut diagnostics);
    let annotations = file.annotations(&onsets, &mut diagnostics);
    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0].description, text);
    assert_eq!(annotations[0].duration, 110_000_000);
}
