//! Player progress schema.
//!
//! [`PlayerRecord`] is the schema-complete shape every read and write returns.
//! [`PlayerDocument`] is the same shape with every field optional: it is what
//! older stored payloads and partial client submissions decode into, and
//! [`PlayerDocument::normalize`] is the only way to turn one into a record.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::day::civil_day;

/// Nickname used when neither the stored record nor the caller supplies one.
pub const DEFAULT_NICKNAME: &str = "Anon";

/// Starting income per click for a fresh record.
pub const DEFAULT_PER_CLICK: f64 = 1.0;

/// Fields stamped by the store on every write; submitted values are dropped.
const SERVER_STAMPED_FIELDS: [&str; 3] = ["key", "lastActivity", "lastResetDate"];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("record payload must be a JSON object")]
    NotAnObject,
    #[error("invalid record field: {0}")]
    InvalidField(#[from] serde_json::Error),
    #[error("{field} must be a non-negative finite number (got {value})")]
    OutOfRange { field: &'static str, value: f64 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upgrades {
    pub click: u64,
    pub passive: u64,
}

/// Ad-watch counters broken down by ad type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdCounters {
    pub interstitial_today: u64,
    pub interstitial_total: u64,
    pub popup_today: u64,
    pub popup_total: u64,
    pub in_app_today: u64,
    pub in_app_total: u64,
}

impl AdCounters {
    pub fn clear_today(&mut self) {
        self.interstitial_today = 0;
        self.popup_today = 0;
        self.in_app_today = 0;
    }

    /// Adds `other` into `self`. Today counters are only added when
    /// `include_today` is set.
    pub fn accumulate(&mut self, other: &AdCounters, include_today: bool) {
        self.interstitial_total = self.interstitial_total.saturating_add(other.interstitial_total);
        self.popup_total = self.popup_total.saturating_add(other.popup_total);
        self.in_app_total = self.in_app_total.saturating_add(other.in_app_total);
        if include_today {
            self.interstitial_today =
                self.interstitial_today.saturating_add(other.interstitial_today);
            self.popup_today = self.popup_today.saturating_add(other.popup_today);
            self.in_app_today = self.in_app_today.saturating_add(other.in_app_today);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub key: String,
    pub nickname: String,
    pub balance: f64,
    pub per_click: f64,
    pub passive_income: f64,
    pub total_earned: f64,
    pub total_clicks: u64,
    pub upgrades: Upgrades,
    pub ads_watched_today: u64,
    pub ads_watched_total: u64,
    #[serde(rename = "ads_watched")]
    pub ads_watched: AdCounters,
    pub daily_bonus_claimed: bool,
    pub big_bonus_claimed: bool,
    pub last_reset_date: NaiveDate,
    pub last_activity: DateTime<Utc>,
}

impl PlayerRecord {
    /// A fresh record with every counter at its default.
    pub fn new(key: &str, nickname: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            nickname: nickname.to_string(),
            balance: 0.0,
            per_click: DEFAULT_PER_CLICK,
            passive_income: 0.0,
            total_earned: 0.0,
            total_clicks: 0,
            upgrades: Upgrades::default(),
            ads_watched_today: 0,
            ads_watched_total: 0,
            ads_watched: AdCounters::default(),
            daily_bonus_claimed: false,
            big_bonus_claimed: false,
            last_reset_date: civil_day(now),
            last_activity: now,
        }
    }

    /// Overwrites every field present in `patch`, including individual
    /// `upgrades` and `ads_watched` entries. Identity and write stamps are
    /// never taken from the patch.
    pub fn apply(&mut self, patch: &PlayerDocument) {
        if let Some(nickname) = non_empty(patch.nickname.as_deref()) {
            self.nickname = nickname.to_string();
        }
        if let Some(value) = patch.balance {
            self.balance = value;
        }
        if let Some(value) = patch.per_click {
            self.per_click = value;
        }
        if let Some(value) = patch.passive_income {
            self.passive_income = value;
        }
        if let Some(value) = patch.total_earned {
            self.total_earned = value;
        }
        if let Some(value) = patch.total_clicks {
            self.total_clicks = value;
        }
        if let Some(upgrades) = &patch.upgrades {
            if let Some(value) = upgrades.click {
                self.upgrades.click = value;
            }
            if let Some(value) = upgrades.passive {
                self.upgrades.passive = value;
            }
        }
        if let Some(value) = patch.ads_watched_today {
            self.ads_watched_today = value;
        }
        if let Some(value) = patch.ads_watched_total {
            self.ads_watched_total = value;
        }
        if let Some(ads) = &patch.ads_watched {
            ads.apply_to(&mut self.ads_watched);
        }
        if let Some(value) = patch.daily_bonus_claimed {
            self.daily_bonus_claimed = value;
        }
        if let Some(value) = patch.big_bonus_claimed {
            self.big_bonus_claimed = value;
        }
    }

    /// Marks the record as written at `now`.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
        self.last_reset_date = civil_day(now);
    }

    /// Zeroes the per-day counters and claim flags. Totals and
    /// `last_activity` are left alone.
    pub fn reset_today(&mut self, day: NaiveDate) {
        self.ads_watched_today = 0;
        self.ads_watched.clear_today();
        self.daily_bonus_claimed = false;
        self.big_bonus_claimed = false;
        self.last_reset_date = day;
    }

    /// Whether the record's Today counters belong to `day`.
    pub fn is_current(&self, day: NaiveDate) -> bool {
        self.last_reset_date == day
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradesDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passive: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdCountersDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interstitial_today: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interstitial_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popup_today: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popup_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_app_today: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_app_total: Option<u64>,
}

impl AdCountersDocument {
    fn apply_to(&self, counters: &mut AdCounters) {
        let fields = [
            (self.interstitial_today, &mut counters.interstitial_today),
            (self.interstitial_total, &mut counters.interstitial_total),
            (self.popup_today, &mut counters.popup_today),
            (self.popup_total, &mut counters.popup_total),
            (self.in_app_today, &mut counters.in_app_today),
            (self.in_app_total, &mut counters.in_app_total),
        ];
        for (value, slot) in fields {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }
}

impl From<AdCounters> for AdCountersDocument {
    fn from(counters: AdCounters) -> Self {
        Self {
            interstitial_today: Some(counters.interstitial_today),
            interstitial_total: Some(counters.interstitial_total),
            popup_today: Some(counters.popup_today),
            popup_total: Some(counters.popup_total),
            in_app_today: Some(counters.in_app_today),
            in_app_total: Some(counters.in_app_total),
        }
    }
}

/// A player record in which any field may be missing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_click: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passive_income: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_earned: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_clicks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrades: Option<UpgradesDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ads_watched_today: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ads_watched_total: Option<u64>,
    #[serde(rename = "ads_watched", skip_serializing_if = "Option::is_none")]
    pub ads_watched: Option<AdCountersDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_bonus_claimed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub big_bonus_claimed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reset_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl PlayerDocument {
    /// Decodes a stored payload. Anything other than a JSON object whose
    /// known fields have the expected types is rejected.
    pub fn decode(raw: &str) -> Result<Self, SchemaError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(SchemaError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Parses client-submitted fields for an upsert.
    ///
    /// Unknown fields are ignored, `username` is accepted in place of
    /// `nickname`, and fields the store stamps itself are dropped.
    pub fn from_patch(fields: &Value) -> Result<Self, SchemaError> {
        let Value::Object(fields) = fields else {
            return Err(SchemaError::NotAnObject);
        };
        let mut fields = fields.clone();
        for name in SERVER_STAMPED_FIELDS {
            fields.remove(name);
        }
        if let Some(username) = fields.remove("username") {
            fields.entry("nickname").or_insert(username);
        }
        let document: PlayerDocument = serde_json::from_value(Value::Object(fields))?;
        document.validate()?;
        Ok(document)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let amounts = [
            ("balance", self.balance),
            ("perClick", self.per_click),
            ("passiveIncome", self.passive_income),
            ("totalEarned", self.total_earned),
        ];
        for (field, value) in amounts {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(SchemaError::OutOfRange { field, value });
                }
            }
        }
        Ok(())
    }

    /// Fills every missing field with its default.
    ///
    /// Present fields are kept as-is. `key` always wins over any key stored
    /// inside the document. The nickname falls back to `fallback_nickname`,
    /// then to [`DEFAULT_NICKNAME`]; write stamps default to `now`.
    pub fn normalize(
        &self,
        key: &str,
        fallback_nickname: Option<&str>,
        now: DateTime<Utc>,
    ) -> PlayerRecord {
        let nickname = non_empty(self.nickname.as_deref())
            .or_else(|| non_empty(fallback_nickname))
            .unwrap_or(DEFAULT_NICKNAME);
        let mut record = PlayerRecord::new(key, nickname, now);
        record.apply(self);
        if let Some(day) = self.last_reset_date {
            record.last_reset_date = day;
        }
        if let Some(at) = self.last_activity {
            record.last_activity = at;
        }
        record
    }
}

impl From<PlayerRecord> for PlayerDocument {
    fn from(record: PlayerRecord) -> Self {
        Self {
            key: Some(record.key),
            nickname: Some(record.nickname),
            balance: Some(record.balance),
            per_click: Some(record.per_click),
            passive_income: Some(record.passive_income),
            total_earned: Some(record.total_earned),
            total_clicks: Some(record.total_clicks),
            upgrades: Some(UpgradesDocument {
                click: Some(record.upgrades.click),
                passive: Some(record.upgrades.passive),
            }),
            ads_watched_today: Some(record.ads_watched_today),
            ads_watched_total: Some(record.ads_watched_total),
            ads_watched: Some(record.ads_watched.into()),
            daily_bonus_claimed: Some(record.daily_bonus_claimed),
            big_bonus_claimed: Some(record.big_bonus_claimed),
            last_reset_date: Some(record.last_reset_date),
            last_activity: Some(record.last_activity),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn full_record() -> PlayerRecord {
        PlayerRecord {
            key: "42".to_string(),
            nickname: "Mira".to_string(),
            balance: 10.5,
            per_click: 3.0,
            passive_income: 2.0,
            total_earned: 900.0,
            total_clicks: 310,
            upgrades: Upgrades { click: 4, passive: 2 },
            ads_watched_today: 3,
            ads_watched_total: 17,
            ads_watched: AdCounters {
                interstitial_today: 1,
                interstitial_total: 9,
                popup_today: 2,
                popup_total: 6,
                in_app_today: 0,
                in_app_total: 2,
            },
            daily_bonus_claimed: true,
            big_bonus_claimed: true,
            last_reset_date: NaiveDate::from_ymd_opt(2024, 4, 30).unwrap(),
            last_activity: Utc.with_ymd_and_hms(2024, 4, 30, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn empty_document_normalizes_to_defaults() {
        let record = PlayerDocument::default().normalize("7", None, now());
        assert_eq!(record, PlayerRecord::new("7", DEFAULT_NICKNAME, now()));
        assert_eq!(record.per_click, DEFAULT_PER_CLICK);
        assert_eq!(record.last_reset_date, civil_day(now()));
    }

    #[test]
    fn normalize_is_idempotent_on_complete_records() {
        let record = full_record();
        let document = PlayerDocument::from(record.clone());
        assert_eq!(document.normalize("42", Some("Other"), now()), record);
    }

    #[test]
    fn normalize_keeps_present_fields_when_any_field_is_missing() {
        let record = full_record();
        let full = serde_json::to_value(&record).unwrap();
        let Value::Object(full) = full else {
            panic!("record should serialize to an object");
        };
        let defaults = PlayerRecord::new("42", "Mira", now());
        let defaults = serde_json::to_value(&defaults).unwrap();

        for missing in full.keys() {
            let mut partial = full.clone();
            partial.remove(missing);
            let raw = serde_json::to_string(&partial).unwrap();
            let document = PlayerDocument::decode(&raw).unwrap();
            let normalized = document.normalize("42", Some("Mira"), now());
            let normalized = serde_json::to_value(&normalized).unwrap();

            for (name, value) in &partial {
                assert_eq!(&normalized[name], value, "field {name} changed");
            }
            if missing != "key" {
                assert_eq!(normalized[missing], defaults[missing], "field {missing} not defaulted");
            }
        }
    }

    #[test]
    fn normalize_fills_missing_nested_entries() {
        let raw = r#"{"upgrades":{"click":3},"ads_watched":{"popupTotal":5}}"#;
        let record = PlayerDocument::decode(raw).unwrap().normalize("1", None, now());
        assert_eq!(record.upgrades, Upgrades { click: 3, passive: 0 });
        assert_eq!(record.ads_watched.popup_total, 5);
        assert_eq!(record.ads_watched.in_app_total, 0);
    }

    #[test]
    fn nickname_falls_back_when_empty() {
        let document = PlayerDocument {
            nickname: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(document.normalize("1", Some("Hint"), now()).nickname, "Hint");
        assert_eq!(document.normalize("1", Some(""), now()).nickname, DEFAULT_NICKNAME);
    }

    #[test]
    fn decode_rejects_non_objects_and_bad_types() {
        assert!(matches!(
            PlayerDocument::decode("[1,2]"),
            Err(SchemaError::NotAnObject)
        ));
        assert!(matches!(
            PlayerDocument::decode("{not json"),
            Err(SchemaError::InvalidField(_))
        ));
        assert!(matches!(
            PlayerDocument::decode(r#"{"totalClicks":"many"}"#),
            Err(SchemaError::InvalidField(_))
        ));
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let document = PlayerDocument::decode(r#"{"legacyField":true,"balance":4}"#).unwrap();
        assert_eq!(document.balance, Some(4.0));
    }

    #[test]
    fn patch_drops_stamped_fields_and_accepts_username() {
        let patch = PlayerDocument::from_patch(&json!({
            "key": "someone-else",
            "lastResetDate": "1999-01-01",
            "lastActivity": "garbage",
            "username": "Vera",
            "totalEarned": 50,
        }))
        .unwrap();
        assert_eq!(patch.key, None);
        assert_eq!(patch.last_reset_date, None);
        assert_eq!(patch.last_activity, None);
        assert_eq!(patch.nickname.as_deref(), Some("Vera"));
        assert_eq!(patch.total_earned, Some(50.0));
    }

    #[test]
    fn patch_prefers_nickname_over_username() {
        let patch =
            PlayerDocument::from_patch(&json!({"nickname": "A", "username": "B"})).unwrap();
        assert_eq!(patch.nickname.as_deref(), Some("A"));
    }

    #[test]
    fn patch_rejects_invalid_payloads() {
        assert!(matches!(
            PlayerDocument::from_patch(&json!([1])),
            Err(SchemaError::NotAnObject)
        ));
        assert!(matches!(
            PlayerDocument::from_patch(&json!({"balance": -1})),
            Err(SchemaError::OutOfRange { field: "balance", .. })
        ));
        assert!(matches!(
            PlayerDocument::from_patch(&json!({"totalClicks": -3})),
            Err(SchemaError::InvalidField(_))
        ));
    }

    #[test]
    fn apply_merges_nested_fields() {
        let mut record = full_record();
        let patch = PlayerDocument::from_patch(&json!({
            "upgrades": {"passive": 9},
            "ads_watched": {"inAppTotal": 4},
        }))
        .unwrap();
        record.apply(&patch);
        assert_eq!(record.upgrades, Upgrades { click: 4, passive: 9 });
        assert_eq!(record.ads_watched.in_app_total, 4);
        assert_eq!(record.ads_watched.popup_total, 6);
    }

    #[test]
    fn reset_today_keeps_totals() {
        let mut record = full_record();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        record.reset_today(day);
        assert_eq!(record.ads_watched_today, 0);
        assert_eq!(record.ads_watched.interstitial_today, 0);
        assert_eq!(record.ads_watched.popup_today, 0);
        assert!(!record.daily_bonus_claimed);
        assert!(!record.big_bonus_claimed);
        assert_eq!(record.ads_watched_total, 17);
        assert_eq!(record.ads_watched.interstitial_total, 9);
        assert_eq!(record.total_earned, 900.0);
        assert_eq!(record.last_reset_date, day);
        assert_eq!(record.last_activity, full_record().last_activity);
    }
}
