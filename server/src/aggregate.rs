//! Leaderboard and global totals computed from a full scan.

use chrono::NaiveDate;
use std::cmp::Ordering;
use tapledger_types::{GlobalStats, LeaderboardEntry, PlayerRecord};

use crate::store::{ProgressStore, ScannedRecord};
use crate::Result;

impl ProgressStore {
    /// The `limit` highest earners, best first. Equal earnings are ordered
    /// by player key so the result is stable between calls.
    pub fn top_players(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let mut records: Vec<PlayerRecord> = self
            .scan_all()?
            .into_iter()
            .filter_map(|entry| match entry {
                ScannedRecord::Decoded(record) => Some(record),
                ScannedRecord::Skipped { .. } => None,
            })
            .collect();
        records.sort_by(rank);
        records.truncate(limit);
        Ok(records.iter().map(LeaderboardEntry::from).collect())
    }

    /// Totals across every player for the store's current civil day.
    pub fn global_stats(&self) -> Result<GlobalStats> {
        self.global_stats_on(self.current_day())
    }

    pub fn global_stats_on(&self, day: NaiveDate) -> Result<GlobalStats> {
        let mut stats = GlobalStats::new(day);
        for entry in self.scan_all()? {
            match entry {
                ScannedRecord::Decoded(record) => stats.accumulate(&record),
                ScannedRecord::Skipped { .. } => stats.skipped += 1,
            }
        }
        Ok(stats)
    }
}

fn rank(a: &PlayerRecord, b: &PlayerRecord) -> Ordering {
    b.total_earned
        .total_cmp(&a.total_earned)
        .then_with(|| a.key.cmp(&b.key))
}
