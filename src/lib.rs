//! # CPAP recording ingestion
//!
//! Turns raw CPAP/BiPAP and oximetry recordings into therapy sessions,
//! compressed channel blobs and daily/period statistics.
//!
//! A device writes one recording as several EDF+ files sharing a timestamp
//! (`BRP` flow waveforms, `PLD` pressure and leak, `SA2` oximetry, `EVE`
//! respiratory events, `CSL` mask on/off). An import:
//!
//! 1. decodes every file into channel segments ([`edf::EdfPlusDecoder`]),
//! 2. merges segments into sessions across short mask-off gaps ([`merger`]),
//! 3. computes per-session indices and encodes every channel into a
//!    checksummed, compressed blob ([`stats`], [`encoder`]),
//! 4. hands sessions to a [`PersistenceGateway`] and recomputes the day and
//!    period rollups from what is stored.
//!
//! Recoverable damage never fails an import; it becomes a [`Diagnostic`] in
//! the [`ImportReport`].
//!
//! ## Quick Start
//!
//! ```rust
//! use cpap_ingest::{Importer, IngestConfig, MemoryGateway, Result};
//! use cpap_ingest::clock::FixedClock;
//! # use cpap_ingest::doctest_utils::{night_start, sample_recording};
//!
//! fn main() -> Result<()> {
//!     # let recording = sample_recording("AirSense_10", night_start(), 300)?;
//!     let importer = Importer::new(IngestConfig::default())?
//!         .with_clock(FixedClock::from_millis(1_719_000_000_000).unwrap());
//!     let mut gateway = MemoryGateway::new();
//!
//!     let report = importer.import(&[recording], &mut gateway)?;
//!     assert_eq!(report.sessions.len(), 1);
//!
//!     let day = &report.days[0];
//!     println!("{}: {:.1} h, AHI {:?}", day.date, day.metrics.therapy_hours, day.metrics.ahi);
//!     Ok(())
//! }
//! ```
//!
//! ## Writing test recordings
//!
//! [`writer::EdfWriter`] produces EDF+ bytes the decoder reads back, which
//! is how the tests build fixtures:
//!
//! ```rust
//! use cpap_ingest::writer::EdfWriter;
//! # use cpap_ingest::Result;
//! # fn main() -> Result<()> {
//! let start = chrono::NaiveDate::from_ymd_opt(2024, 6, 21).unwrap().and_hms_opt(22, 0, 0).unwrap();
//! let mut writer = EdfWriter::new(start);
//! writer.set_datarecord_duration(60.0)?;
//! writer.write_samples(&[])?;
//! writer.add_annotation(30.0, Some(11.0), "Central Apnea")?;
//! let bytes = writer.finish()?;
//! assert_eq!(&bytes[192..197], b"EDF+C");
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod decoder;
pub mod diagnostics;
pub mod edf;
pub mod encoder;
pub mod error;
pub mod gateway;
pub mod import;
pub mod merger;
pub mod stats;
pub mod types;
pub mod utils;
pub mod writer;

#[doc(hidden)]
pub mod doctest_utils; // For doctest and integration test fixtures

// Re-export main types for convenience
pub use config::IngestConfig;
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use encoder::EncodedChannel;
pub use error::{IngestError, Result};
pub use gateway::{MemoryGateway, PersistenceGateway};
pub use import::{ImportReport, Importer};
pub use types::{
    ChannelData, ChannelDescriptor, ChannelId, ChannelKind, Recording, RecordingFile, Segment, Session,
    SessionKey,
};

// Important constants
pub const EDF_TIME_DIMENSION: i64 = 10_000_000; // 100 nanoseconds unit
pub const EDF_MAX_SIGNALS: usize = 4096;
pub const MS_PER_HOUR: i64 = 3_600_000;

/// Library version
///
/// ```rust
/// let version = cpap_ingest::version();
/// assert!(version.contains('.'));
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
