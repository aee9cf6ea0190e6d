//! Player progress records, civil-day time model, and the aggregate payloads
//! served by tapledger.

pub mod api;
pub mod day;
pub mod record;

pub use api::{GlobalStats, LeaderboardEntry, ResetReport};
pub use day::civil_day;
pub use record::{
    AdCounters, PlayerDocument, PlayerRecord, SchemaError, Upgrades, DEFAULT_NICKNAME,
};
