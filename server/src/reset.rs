//! Daily rollover of the per-day counters.
//!
//! Days roll over at midnight UTC+3. The store never schedules itself;
//! callers either invoke [`ProgressStore::reset_daily`] directly or poll
//! [`ProgressStore::reset_if_new_day`], which consults a marker persisted
//! in the backend so that only one process resets a given day.

use chrono::NaiveDate;
use tapledger_types::ResetReport;
use tracing::{debug, error, info, warn};

use crate::store::{ProgressStore, ScannedRecord};
use crate::Result;

impl ProgressStore {
    /// Zeroes every record's Today counters and claim flags and marks it
    /// as belonging to the current civil day. Corrupt records are skipped.
    pub fn reset_daily(&self) -> Result<ResetReport> {
        self.reset_day(self.current_day())
    }

    /// Runs [`Self::reset_daily`] unless today's reset has already been
    /// claimed by this or another process. A pass that fails hands the
    /// claim back so a later poll retries it.
    pub fn reset_if_new_day(&self) -> Result<Option<ResetReport>> {
        let day = self.current_day();
        if !self.claim_reset_day(day)? {
            debug!(day = %day, "daily reset already done");
            return Ok(None);
        }
        match self.reset_day(day) {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                warn!(day = %day, "daily reset failed; releasing claim: {err}");
                if let Err(release) = self.release_reset_day(day) {
                    error!(day = %day, "failed to release daily reset claim: {release}");
                }
                Err(err)
            }
        }
    }

    fn reset_day(&self, day: NaiveDate) -> Result<ResetReport> {
        let _guard = self.write_guard();
        let mut report = ResetReport {
            day,
            reset: 0,
            skipped: 0,
        };
        for entry in self.scan_all()? {
            match entry {
                ScannedRecord::Decoded(mut record) => {
                    record.reset_today(day);
                    self.put(&record)?;
                    report.reset += 1;
                }
                ScannedRecord::Skipped { .. } => report.skipped += 1,
            }
        }
        self.claim_reset_day(day)?;
        self.metrics().record_reset(report.reset);
        info!(
            day = %day,
            reset = report.reset,
            skipped = report.skipped,
            backend = self.backend_name(),
            "daily reset complete"
        );
        Ok(report)
    }
}
