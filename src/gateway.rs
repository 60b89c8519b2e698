//! Persistence boundary.
//!
//! The core never talks to a database. It hands finished sessions, channel
//! blobs and statistics rows to a [`PersistenceGateway`]; every write is an
//! upsert keyed by a natural identifier, so replaying an import replaces
//! rows instead of duplicating them.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::encoder::EncodedChannel;
use crate::error::{IngestError, Result};
use crate::stats::{DayStatistics, PeriodStatistics, PeriodType, SessionStatistics};
use crate::types::SessionKey;

/// Session row as handed to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub profile: String,
    pub recording_id: String,
    /// Therapy day the session counts towards
    pub date: NaiveDate,
    pub start_ms: i64,
    pub end_ms: i64,
    pub statistics: SessionStatistics,
    /// Files the session was assembled from
    pub sources: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub key: SessionKey,
    /// false when an existing row was replaced
    pub created: bool,
}

/// A session read back for recomputation, with its channel blobs as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub record: SessionRecord,
    pub blobs: Vec<Vec<u8>>,
}

pub trait PersistenceGateway {
    /// Atomically writes the session row and replaces all its channel blobs.
    fn create_or_update_session(
        &mut self,
        record: &SessionRecord,
        channels: &[EncodedChannel],
    ) -> Result<SessionHandle>;

    fn upsert_day_statistics(&mut self, profile: &str, date: NaiveDate, stats: &DayStatistics) -> Result<()>;

    fn upsert_period_statistics(
        &mut self,
        profile: &str,
        period_type: PeriodType,
        start: NaiveDate,
        end: NaiveDate,
        stats: &PeriodStatistics,
    ) -> Result<()>;

    fn sessions_for_day(&self, profile: &str, date: NaiveDate) -> Result<Vec<StoredSession>>;

    /// Day rows with `start <= date <= end`, ordered by date.
    fn day_statistics_in_range(&self, profile: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DayStatistics>>;
}

/// In-memory gateway keyed the same way a relational store would be.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    sessions: BTreeMap<SessionKey, StoredSession>,
    days: BTreeMap<(String, NaiveDate), DayStatistics>,
    periods: BTreeMap<(String, PeriodType, NaiveDate), PeriodStatistics>,
    fail_session_writes: usize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` session writes fail with a conflict.
    pub fn fail_next_session_writes(&mut self, n: usize) {
        self.fail_session_writes = n;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, key: &SessionKey) -> Option<&StoredSession> {
        self.sessions.get(key)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &StoredSession> {
        self.sessions.values()
    }

    /// Direct access to stored blobs, e.g. to simulate storage corruption.
    pub fn blobs_mut(&mut self, key: &SessionKey) -> Option<&mut Vec<Vec<u8>>> {
        self.sessions.get_mut(key).map(|s| &mut s.blobs)
    }

    pub fn day(&self, profile: &str, date: NaiveDate) -> Option<&DayStatistics> {
        self.days.get(&(profile.to_string(), date))
    }

    pub fn day_count(&self) -> usize {
        self.days.len()
    }

    pub fn period(&self, profile: &str, period_type: PeriodType, start: NaiveDate) -> Option<&PeriodStatistics> {
        self.periods.get(&(profile.to_string(), period_type, start))
    }

    pub fn period_count(&self) -> usize {
        self.periods.len()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn create_or_update_session(
        &mut self,
        record: &SessionRecord,
        channels: &[EncodedChannel],
    ) -> Result<SessionHandle> {
        if self.fail_session_writes > 0 {
            self.fail_session_writes -= 1;
            return Err(IngestError::PersistenceConflict {
                key: record.key.to_string(),
                reason: "row locked by another writer".to_string(),
            });
        }

        // 先全部序列化，保证写入是原子的
        let blobs = channels.iter().map(|c| c.to_bytes()).collect::<Result<Vec<_>>>()?;

        let mut record = record.clone();
        let created = match self.sessions.get(&record.key) {
            Some(existing) => {
                record.created_at = existing.record.created_at;
                false
            }
            None => true,
        };
        let key = record.key.clone();
        self.sessions.insert(key.clone(), StoredSession { record, blobs });
        Ok(SessionHandle { key, created })
    }

    fn upsert_day_statistics(&mut self, profile: &str, date: NaiveDate, stats: &DayStatistics) -> Result<()> {
        self.days.insert((profile.to_string(), date), stats.clone());
        Ok(())
    }

    fn upsert_period_statistics(
        &mut self,
        profile: &str,
        period_type: PeriodType,
        start: NaiveDate,
        _end: NaiveDate,
        stats: &PeriodStatistics,
    ) -> Result<()> {
        self.periods.insert((profile.to_string(), period_type, start), stats.clone());
        Ok(())
    }

    fn sessions_for_day(&self, profile: &str, date: NaiveDate) -> Result<Vec<StoredSession>> {
        Ok(self
            .sessions
            .values()
            .filter(|s| s.record.profile == profile && s.record.date == date)
            .cloned()
            .collect())
    }

    fn day_statistics_in_range(&self, profile: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DayStatistics>> {
        let profile = profile.to_string();
        Ok(self
            .days
            .range((profile.clone(), start)..=(profile, end))
            .map(|(_, stats)| stats.clone())
            .collect())
    }
}
