use chrono::{NaiveDate, NaiveDateTime};
use cpap_ingest::clock::FixedClock;
use cpap_ingest::doctest_utils::{minutes_after, night_start, recording_file, sample_recording};
use cpap_ingest::edf::SignalParam;
use cpap_ingest::gateway::{SessionHandle, SessionRecord, StoredSession};
use cpap_ingest::stats::{DayStatistics, PeriodStatistics, PeriodType};
use cpap_ingest::writer::EdfWriter;
use cpap_ingest::{
    ChannelId, EncodedChannel, ImportReport, Importer, IngestConfig, IngestError, MemoryGateway, PersistenceGateway,
    Recording,
};
use std::io::{self, Write};
use std::sync::atomic::Ordering;

const DEVICE: &str = "AirSense_10-23192451234";
const IMPORTED_AT: i64 = 1_719_050_000_000;

// 创建测试导入器的辅助函数
fn importer_with(config: IngestConfig, at: i64) -> Importer {
    Importer::new(config)
        .unwrap()
        .with_clock(FixedClock::from_millis(at).unwrap())
}

fn importer() -> Importer {
    importer_with(IngestConfig::default(), IMPORTED_AT)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn night(start: NaiveDateTime, minutes: usize) -> Recording {
    sample_recording(DEVICE, start, minutes).unwrap()
}

fn count(report: &ImportReport, name: &str) -> usize {
    report.diagnostics.iter().filter(|d| d.kind.name() == name).count()
}

// 会话写入总是因IO失败的网关
struct BrokenDisk(MemoryGateway);

impl PersistenceGateway for BrokenDisk {
    fn create_or_update_session(
        &mut self,
        _: &SessionRecord,
        _: &[EncodedChannel],
    ) -> cpap_ingest::Result<SessionHandle> {
        Err(io::Error::new(io::ErrorKind::Other, "disk full").into())
    }

    fn upsert_day_statistics(
        &mut self,
        profile: &str,
        date: NaiveDate,
        stats: &DayStatistics,
    ) -> cpap_ingest::Result<()> {
        self.0.upsert_day_statistics(profile, date, stats)
    }

    fn upsert_period_statistics(
        &mut self,
        profile: &str,
        period_type: PeriodType,
        start: NaiveDate,
        end: NaiveDate,
        stats: &PeriodStatistics,
    ) -> cpap_ingest::Result<()> {
        self.0.upsert_period_statistics(profile, period_type, start, end, stats)
    }

    fn sessions_for_day(&self, profile: &str, date: NaiveDate) -> cpap_ingest::Result<Vec<StoredSession>> {
        self.0.sessions_for_day(profile, date)
    }

    fn day_statistics_in_range(
        &self,
        profile: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> cpap_ingest::Result<Vec<DayStatistics>> {
        self.0.day_statistics_in_range(profile, start, end)
    }
}

/// Pressure only, at 1 Hz instead of the usual 0.5 Hz
fn fast_pressure_file(start: NaiveDateTime, minutes: usize) -> Vec<u8> {
    let mut writer = EdfWriter::new(start);
    writer
        .add_signal(SignalParam {
            label: "Press.2s".to_string(),
            physical_max: 327.67,
            physical_min: -327.68,
            digital_max: 32767,
            digital_min: -32768,
            samples_per_record: 60,
            physical_dimension: "cmH2O".to_string(),
            prefilter: String::new(),
            transducer: String::new(),
        })
        .unwrap();
    writer.set_datarecord_duration(60.0).unwrap();
    for _ in 0..minutes {
        writer.write_samples(&[vec![10.0; 60]]).unwrap();
    }
    writer.finish().unwrap()
}

#[test]
fn test_full_night_import() {
    let mut gateway = MemoryGateway::new();
    let report = importer().import(&[night(night_start(), 300)], &mut gateway).unwrap();

    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    assert_eq!(report.sessions.len(), 1);
    assert!(report.sessions[0].created);
    assert_eq!(gateway.session_count(), 1);

    let stored = gateway.session(&report.sessions[0].key).unwrap();
    assert_eq!(stored.record.date, date(2024, 6, 21));
    assert_eq!(stored.record.end_ms - stored.record.start_ms, 5 * 3_600_000);
    assert_eq!(stored.record.sources.len(), 4);
    // Pressure, Leak, SpO2, Pulse, seven event channels, MaskOn
    assert_eq!(stored.blobs.len(), 12);

    let stats = &stored.record.statistics;
    assert_eq!(stats.counts.obstructive, 2);
    assert_eq!(stats.counts.hypopnea, 1);
    assert_eq!(stats.counts.central, 1);
    assert_eq!(stats.counts.mixed, 0);
    assert!((stats.ahi.unwrap() - 0.8).abs() < 1e-9);
    assert!((stats.pressure.unwrap().median - 9.5).abs() < 0.02);
    assert!((stats.spo2.unwrap().mean - 95.0).abs() < 0.02);
    assert_eq!(stats.spo2_seconds_below_90, Some(0.0));
    assert!(stats.respiratory_rate.is_none());

    assert_eq!(report.days.len(), 1);
    let day = gateway.day("default", date(2024, 6, 21)).unwrap();
    assert_eq!(day.session_count, 1);
    assert!((day.metrics.ahi.unwrap() - 0.8).abs() < 1e-9);
    assert!((day.metrics.leak.unwrap().p95 - 12.0).abs() < 0.02);
    assert!((day.metrics.leak.unwrap().p70 - 12.0).abs() < 0.02);

    // 2024-06-21 is a Friday
    assert_eq!(report.periods.len(), 2);
    let week = gateway.period("default", PeriodType::Weekly, date(2024, 6, 17)).unwrap();
    assert_eq!(week.end, date(2024, 6, 23));
    assert_eq!(week.total_days, 7);
    assert_eq!(week.days_used, 1);
    assert!((week.compliance_rate - 1.0 / 7.0).abs() < 1e-9);
    assert_eq!(week.total_events, 4);
    let month = gateway.period("default", PeriodType::Monthly, date(2024, 6, 1)).unwrap();
    assert_eq!(month.total_days, 30);
    assert!((month.avg_therapy_hours - 5.0 / 30.0).abs() < 1e-9);
}

#[test]
fn test_reimport_is_idempotent() {
    let mut gateway = MemoryGateway::new();
    let recordings = [night(night_start(), 120)];

    let first = importer().import(&recordings, &mut gateway).unwrap();
    let stored = gateway.session(&first.sessions[0].key).unwrap().clone();
    let day = gateway.day("default", date(2024, 6, 21)).unwrap().clone();
    let week = gateway.period("default", PeriodType::Weekly, date(2024, 6, 17)).unwrap().clone();
    let month = gateway.period("default", PeriodType::Monthly, date(2024, 6, 1)).unwrap().clone();

    let second = importer().import(&recordings, &mut gateway).unwrap();
    assert!(!second.sessions[0].created);
    assert_eq!(gateway.session_count(), 1);
    assert_eq!(gateway.day_count(), 1);
    assert_eq!(gateway.period_count(), 2);
    assert_eq!(gateway.session(&first.sessions[0].key).unwrap(), &stored);
    assert_eq!(gateway.day("default", date(2024, 6, 21)).unwrap(), &day);
    assert_eq!(gateway.period("default", PeriodType::Weekly, date(2024, 6, 17)).unwrap(), &week);
    assert_eq!(gateway.period("default", PeriodType::Monthly, date(2024, 6, 1)).unwrap(), &month);
    assert_eq!(second.periods, first.periods);
    assert_eq!(second.days, first.days);
}

#[test]
fn test_reimport_keeps_created_at() {
    let mut gateway = MemoryGateway::new();
    let recordings = [night(night_start(), 60)];

    let first = importer().import(&recordings, &mut gateway).unwrap();
    importer_with(IngestConfig::default(), IMPORTED_AT + 86_400_000)
        .import(&recordings, &mut gateway)
        .unwrap();

    let record = &gateway.session(&first.sessions[0].key).unwrap().record;
    assert_eq!(record.created_at.timestamp_millis(), IMPORTED_AT);
    assert_eq!(record.updated_at.timestamp_millis(), IMPORTED_AT + 86_400_000);
}

#[test]
fn test_day_split_groups_sessions_after_midnight() {
    let config = IngestConfig {
        day_split_hour: 12,
        ..IngestConfig::default()
    };
    let second_start = minutes_after(night_start(), 240); // 02:00 next morning
    let mut gateway = MemoryGateway::new();
    let report = importer_with(config, IMPORTED_AT)
        .import(&[night(night_start(), 180), night(second_start, 120)], &mut gateway)
        .unwrap();

    assert_eq!(report.sessions.len(), 2);
    assert_eq!(report.days.len(), 1);
    // 凌晨的会话归入前一天
    let dates: Vec<NaiveDate> = gateway.sessions().map(|s| s.record.date).collect();
    assert_eq!(dates, vec![date(2024, 6, 21), date(2024, 6, 21)]);

    let day = gateway.day("default", date(2024, 6, 21)).unwrap();
    assert_eq!(day.session_count, 2);
    assert!((day.metrics.therapy_hours - 5.0).abs() < 1e-9);
    assert_eq!(day.metrics.counts.apnea_hypopnea(), 8);
    assert!((day.metrics.ahi.unwrap() - 1.6).abs() < 1e-9);
    assert!(gateway.day("default", date(2024, 6, 22)).is_none());
}

#[test]
fn test_day_recomputed_from_all_stored_sessions() {
    let mut gateway = MemoryGateway::new();
    importer().import(&[night(night_start(), 60)], &mut gateway).unwrap();
    let report = importer()
        .import(&[night(minutes_after(night_start(), 90), 60)], &mut gateway)
        .unwrap();

    // 第二次导入只带一个会话，但日统计包含两个
    assert_eq!(report.sessions.len(), 1);
    let day = gateway.day("default", date(2024, 6, 21)).unwrap();
    assert_eq!(day.session_count, 2);
    assert!((day.metrics.therapy_hours - 2.0).abs() < 1e-9);
}

#[test]
fn test_unknown_files_are_ignored() {
    let mut recording = night(night_start(), 60);
    recording.files.push(recording_file(night_start(), "XYZ", b"not an edf file".to_vec()));
    recording.files.push(cpap_ingest::RecordingFile {
        name: "Identification.tgt".to_string(),
        bytes: b"#SRN 23192451234".to_vec(),
    });

    let mut gateway = MemoryGateway::new();
    let report = importer().import(&[recording], &mut gateway).unwrap();
    assert!(report.diagnostics.is_empty());
    assert_eq!(report.sessions.len(), 1);
}

#[test]
fn test_unreadable_file_is_reported_and_skipped() {
    let mut recording = night(night_start(), 60);
    recording.files.push(recording_file(night_start(), "BRP", vec![0xAB; 700]));

    let mut gateway = MemoryGateway::new();
    let report = importer().import(&[recording], &mut gateway).unwrap();

    assert_eq!(count(&report, "HeaderParseError"), 1);
    assert!(report.diagnostics[0].source.ends_with("_BRP.edf"));
    assert_eq!(report.sessions.len(), 1);
    let stored = gateway.session(&report.sessions[0].key).unwrap();
    assert_eq!(stored.record.sources.len(), 4);
}

#[test]
fn test_nothing_decodable_aborts() {
    let recording = Recording {
        device: DEVICE.to_string(),
        recording_id: "20240621_220000".to_string(),
        files: vec![
            recording_file(night_start(), "PLD", b"garbage".to_vec()),
            recording_file(night_start(), "EVE", Vec::new()),
        ],
    };

    let mut gateway = MemoryGateway::new();
    let result = importer().import(&[recording], &mut gateway);
    assert!(matches!(result, Err(IngestError::NoDecodableSegments)));
    assert_eq!(gateway.session_count(), 0);
    assert_eq!(gateway.day_count(), 0);
}

#[test]
fn test_cancelled_import_persists_nothing() {
    let importer = importer();
    importer.cancel_handle().store(true, Ordering::SeqCst);

    let mut gateway = MemoryGateway::new();
    let result = importer.import(&[night(night_start(), 60)], &mut gateway);
    assert!(matches!(result, Err(IngestError::Cancelled)));
    assert_eq!(gateway.session_count(), 0);
    assert_eq!(gateway.day_count(), 0);
    assert_eq!(gateway.period_count(), 0);
}

#[test]
fn test_persistence_conflict_is_retried_once() {
    let mut gateway = MemoryGateway::new();
    gateway.fail_next_session_writes(1);

    let report = importer().import(&[night(night_start(), 60)], &mut gateway).unwrap();
    assert_eq!(count(&report, "PersistenceConflict"), 1);
    assert_eq!(report.sessions.len(), 1);
    assert!(report.failed_sessions.is_empty());
    assert_eq!(gateway.session_count(), 1);
}

#[test]
fn test_persistent_conflict_is_reported() {
    let mut gateway = MemoryGateway::new();
    gateway.fail_next_session_writes(2);

    let report = importer().import(&[night(night_start(), 60)], &mut gateway).unwrap();
    assert_eq!(count(&report, "PersistenceConflict"), 2);
    assert!(report.sessions.is_empty());
    assert_eq!(report.failed_sessions.len(), 1);
    assert!(report.days.is_empty());
    assert_eq!(gateway.session_count(), 0);
}

#[test]
fn test_gateway_failure_is_not_a_conflict() {
    let mut gateway = BrokenDisk(MemoryGateway::new());
    let report = importer().import(&[night(night_start(), 60)], &mut gateway).unwrap();

    // IO错误不重试
    assert_eq!(count(&report, "PersistenceError"), 1);
    assert_eq!(count(&report, "PersistenceConflict"), 0);
    assert!(report.diagnostics[0].message.contains("disk full"));
    assert!(report.sessions.is_empty());
    assert_eq!(report.failed_sessions.len(), 1);
    assert_eq!(gateway.0.session_count(), 0);
}

#[test]
fn test_unencodable_channel_dropped_from_session() {
    let mut recording = night(night_start(), 60);
    let later = minutes_after(night_start(), 61);
    recording.files.push(recording_file(later, "PLD", fast_pressure_file(later, 10)));

    let mut gateway = MemoryGateway::new();
    let report = importer().import(&[recording], &mut gateway).unwrap();

    assert_eq!(count(&report, "EncodeError"), 1);
    assert_eq!(count(&report, "DecodeIntegrityError"), 0);
    let diagnostic = report.diagnostics.iter().find(|d| d.kind.name() == "EncodeError").unwrap();
    assert_eq!(diagnostic.channel, Some(ChannelId::Pressure));

    assert_eq!(report.sessions.len(), 1);
    let stored = gateway.session(&report.sessions[0].key).unwrap();
    assert_eq!(stored.blobs.len(), 11);
    assert!(stored.record.statistics.pressure.is_some());
}

#[test]
fn test_corrupted_blob_reported_during_recompute() {
    let mut gateway = MemoryGateway::new();
    let first = importer().import(&[night(night_start(), 60)], &mut gateway).unwrap();
    let key = first.sessions[0].key.clone();

    // 翻转存储的CRC字段
    let blobs = gateway.blobs_mut(&key).unwrap();
    blobs[0][59] ^= 0xFF;

    let report = importer()
        .import(&[night(minutes_after(night_start(), 90), 60)], &mut gateway)
        .unwrap();
    assert_eq!(count(&report, "DecodeIntegrityError"), 1);
    let diagnostic = report
        .diagnostics
        .iter()
        .find(|d| d.kind.name() == "DecodeIntegrityError")
        .unwrap();
    assert_eq!(diagnostic.source, key.to_string());

    // 事件计数来自会话行，不受影响
    let day = gateway.day("default", date(2024, 6, 21)).unwrap();
    assert_eq!(day.session_count, 2);
    assert_eq!(day.metrics.counts.apnea_hypopnea(), 8);
}

#[test]
fn test_short_night_is_not_a_used_day() {
    let mut gateway = MemoryGateway::new();
    let report = importer().import(&[night(night_start(), 60)], &mut gateway).unwrap();

    let week = gateway.period("default", PeriodType::Weekly, date(2024, 6, 17)).unwrap();
    assert_eq!(week.days_used, 0);
    assert_eq!(week.avg_ahi, None);
    assert_eq!(week.compliance_rate, 0.0);
    assert!(count(&report, "AggregationInputMissing") >= 1);
}

#[test]
fn test_invalid_descriptor_rejected_up_front() {
    let mut config = IngestConfig::default();
    config.formats[1].channels[0].gain = 0.0;
    assert!(matches!(Importer::new(config), Err(IngestError::InvalidDescriptor(_))));
}

#[test]
fn test_config_file_drives_import() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "profile = \"alice\"").unwrap();
    writeln!(file, "usage_threshold_hours = 0.5").unwrap();
    writeln!(file, "period_types = [\"yearly\"]").unwrap();
    writeln!(file, "worker_threads = 2").unwrap();

    let config = IngestConfig::from_file(file.path()).unwrap();
    let mut gateway = MemoryGateway::new();
    let report = importer_with(config, IMPORTED_AT)
        .import(&[night(night_start(), 60)], &mut gateway)
        .unwrap();

    assert_eq!(report.periods.len(), 1);
    assert!(gateway.day("default", date(2024, 6, 21)).is_none());
    assert!(gateway.day("alice", date(2024, 6, 21)).is_some());
    let year = gateway.period("alice", PeriodType::Yearly, date(2024, 1, 1)).unwrap();
    assert_eq!(year.total_days, 366);
    assert_eq!(year.days_used, 1);
}

#[test]
fn test_session_channels_survive_storage() {
    let mut gateway = MemoryGateway::new();
    let report = importer().import(&[night(night_start(), 30)], &mut gateway).unwrap();
    let stored = gateway.session(&report.sessions[0].key).unwrap();

    let mut found = Vec::new();
    for blob in &stored.blobs {
        let encoded = cpap_ingest::EncodedChannel::from_bytes(blob).unwrap();
        let data = encoded.decode().unwrap();
        if encoded.channel == ChannelId::Pulse {
            assert_eq!(data.sample_count(), 30 * 60);
            assert!(data.values().iter().all(|v| (v - 62.0).abs() < 0.02));
        }
        found.push(encoded.channel);
    }
    assert!(found.contains(&ChannelId::MaskOn));
    assert!(found.contains(&ChannelId::ObstructiveApnea));
}
