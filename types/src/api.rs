use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::record::{AdCounters, PlayerRecord};

/// One row of the earnings leaderboard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub nickname: String,
    pub total_earned: f64,
}

impl From<&PlayerRecord> for LeaderboardEntry {
    fn from(record: &PlayerRecord) -> Self {
        Self {
            nickname: record.nickname.clone(),
            total_earned: record.total_earned,
        }
    }
}

/// Counters summed across every player.
///
/// Today portions only include records whose `lastResetDate` equals `day`,
/// so stale counters from players who have not reported in since the last
/// rollover are not double-counted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub day: NaiveDate,
    pub total_earned: f64,
    pub total_clicks: u64,
    pub click_upgrades: u64,
    pub passive_upgrades: u64,
    pub ads_watched_today: u64,
    pub ads_watched_total: u64,
    pub users: u64,
    pub skipped: u64,
    pub ads: AdCounters,
}

impl GlobalStats {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            total_earned: 0.0,
            total_clicks: 0,
            click_upgrades: 0,
            passive_upgrades: 0,
            ads_watched_today: 0,
            ads_watched_total: 0,
            users: 0,
            skipped: 0,
            ads: AdCounters::default(),
        }
    }

    pub fn accumulate(&mut self, record: &PlayerRecord) {
        let current = record.is_current(self.day);
        self.users += 1;
        self.total_earned += record.total_earned;
        self.total_clicks = self.total_clicks.saturating_add(record.total_clicks);
        self.click_upgrades = self.click_upgrades.saturating_add(record.upgrades.click);
        self.passive_upgrades = self.passive_upgrades.saturating_add(record.upgrades.passive);
        self.ads_watched_total = self.ads_watched_total.saturating_add(record.ads_watched_total);
        if current {
            self.ads_watched_today = self.ads_watched_today.saturating_add(record.ads_watched_today);
        }
        self.ads.accumulate(&record.ads_watched, current);
    }
}

/// Outcome of a daily reset pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub day: NaiveDate,
    pub reset: u64,
    pub skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn stale_records_only_count_towards_totals() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let today = crate::civil_day(now);
        let mut fresh = PlayerRecord::new("a", "A", now);
        fresh.ads_watched_today = 2;
        fresh.ads_watched_total = 5;
        fresh.ads_watched.popup_today = 2;
        fresh.ads_watched.popup_total = 5;
        let mut stale = fresh.clone();
        stale.key = "b".to_string();
        stale.last_reset_date = today.pred_opt().unwrap();

        let mut stats = GlobalStats::new(today);
        stats.accumulate(&fresh);
        stats.accumulate(&stale);

        assert_eq!(stats.users, 2);
        assert_eq!(stats.ads_watched_today, 2);
        assert_eq!(stats.ads_watched_total, 10);
        assert_eq!(stats.ads.popup_today, 2);
        assert_eq!(stats.ads.popup_total, 10);
    }
}
