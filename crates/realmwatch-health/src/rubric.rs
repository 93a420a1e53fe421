//! Health scoring rubric.
//!
//! A score is the sum of the points of every rule whose signal is present
//! in the payload, clamped to `[0, 100]`. Rules are plain data so weights
//! and field names can change without touching the scheduler.
//!
//! Field lookups are lenient: a missing or oddly-typed field means the
//! rule awards nothing. Only a payload that is not a JSON object at all is
//! an error.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use realm_core::{StatusPayload, json_kind};
use serde_json::Value;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// What a rubric rule looks for in a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The realm answered with a well-formed document.
    Responded,
    /// The first present field among these holds a count greater than zero.
    PositiveCount(&'static [&'static str]),
    /// The realm shows activity within the scorer's trailing window.
    RecentActivity,
}

/// One line of the rubric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RubricRule {
    pub name: &'static str,
    pub points: u8,
    pub signal: Signal,
}

/// Whether a single rule matched, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleOutcome {
    pub rule: &'static str,
    pub points: u8,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("status payload must be an object, got {0}")]
    NotAnObject(&'static str),
}

pub const USER_FIELDS: &[&str] = &["users", "users_count", "participants", "participants_count"];
pub const ORGANIZATION_FIELDS: &[&str] = &["orgs", "organizations", "organizations_count", "groups"];
pub const EXTENSION_FIELDS: &[&str] = &["extensions", "extensions_count", "modules"];

/// Explicit activity flag.
const ACTIVITY_FLAG_FIELDS: &[&str] = &["recent_activity"];
/// Timestamps of the latest governance events.
const ACTIVITY_TIMESTAMP_FIELDS: &[&str] =
    &["last_activity_at", "last_proposal_at", "last_transaction_at"];
/// Entity counters; any non-zero value counts as activity.
const ACTIVITY_COUNTER_FIELDS: &[&str] = &[
    "mandates_count",
    "tasks_count",
    "transfers_count",
    "proposals_count",
    "votes_count",
];

pub const DEFAULT_RUBRIC: &[RubricRule] = &[
    RubricRule {
        name: "responded",
        points: 50,
        signal: Signal::Responded,
    },
    RubricRule {
        name: "users",
        points: 20,
        signal: Signal::PositiveCount(USER_FIELDS),
    },
    RubricRule {
        name: "organizations",
        points: 10,
        signal: Signal::PositiveCount(ORGANIZATION_FIELDS),
    },
    RubricRule {
        name: "extensions",
        points: 10,
        signal: Signal::PositiveCount(EXTENSION_FIELDS),
    },
    RubricRule {
        name: "recent_activity",
        points: 10,
        signal: Signal::RecentActivity,
    },
];

/// Deterministic payload → score function.
#[derive(Debug, Clone)]
pub struct HealthScorer {
    rules: Vec<RubricRule>,
    activity_window: Duration,
}

impl Default for HealthScorer {
    fn default() -> Self {
        Self::new(7)
    }
}

impl HealthScorer {
    /// Default rubric with an activity window of `activity_window_days`.
    pub fn new(activity_window_days: u32) -> Self {
        Self {
            rules: DEFAULT_RUBRIC.to_vec(),
            activity_window: DAY * activity_window_days,
        }
    }

    /// Replace the rubric.
    pub fn with_rules(mut self, rules: Vec<RubricRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &[RubricRule] {
        &self.rules
    }

    /// Score a payload as of `now_ms` (Unix milliseconds).
    ///
    /// The reference time is an argument so the same payload always gets
    /// the same score for the same snapshot time.
    pub fn score(&self, payload: &StatusPayload, now_ms: u64) -> Result<u8, ScoreError> {
        let total: u32 = self
            .breakdown(payload, now_ms)?
            .iter()
            .filter(|o| o.matched)
            .map(|o| o.points as u32)
            .sum();
        Ok(total.min(100) as u8)
    }

    /// Evaluate every rule and report which ones matched.
    pub fn breakdown(
        &self,
        payload: &StatusPayload,
        now_ms: u64,
    ) -> Result<Vec<RuleOutcome>, ScoreError> {
        if payload.as_object().is_none() {
            return Err(ScoreError::NotAnObject(json_kind(payload.as_value())));
        }

        Ok(self
            .rules
            .iter()
            .map(|rule| RuleOutcome {
                rule: rule.name,
                points: rule.points,
                matched: self.matches(&rule.signal, payload, now_ms),
            })
            .collect())
    }

    fn matches(&self, signal: &Signal, payload: &StatusPayload, now_ms: u64) -> bool {
        match signal {
            Signal::Responded => true,
            Signal::PositiveCount(fields) => first_present(payload, fields)
                .and_then(count_of)
                .is_some_and(|n| n > 0),
            Signal::RecentActivity => self.has_recent_activity(payload, now_ms),
        }
    }

    fn has_recent_activity(&self, payload: &StatusPayload, now_ms: u64) -> bool {
        let flagged = ACTIVITY_FLAG_FIELDS
            .iter()
            .any(|f| payload.field(f).and_then(Value::as_bool) == Some(true));
        if flagged {
            return true;
        }

        let window_start = now_ms.saturating_sub(self.activity_window.as_millis() as u64);
        let recent_event = ACTIVITY_TIMESTAMP_FIELDS
            .iter()
            .filter_map(|f| payload.field(f).and_then(timestamp_ms))
            .any(|ts| ts >= window_start);
        if recent_event {
            return true;
        }

        ACTIVITY_COUNTER_FIELDS
            .iter()
            .filter_map(|f| payload.field(f).and_then(count_of))
            .any(|n| n > 0)
    }
}

fn first_present<'a>(payload: &'a StatusPayload, fields: &[&str]) -> Option<&'a Value> {
    fields
        .iter()
        .find_map(|f| payload.field(f).filter(|v| !v.is_null()))
}

/// Interpret a value as a count: numbers, numeric strings (candid renders
/// large nats as `"1_000"`), or the length of an array or map.
fn count_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f.ceil() as u64))
            .or(Some(0)),
        Value::String(s) => parse_number(s),
        Value::Array(items) => Some(items.len() as u64),
        Value::Object(map) => Some(map.len() as u64),
        Value::Bool(_) | Value::Null => None,
    }
}

/// Interpret a value as a Unix timestamp and normalize it to milliseconds.
///
/// Seconds, milliseconds, microseconds and nanoseconds (the canister
/// clock) are told apart by magnitude.
fn timestamp_ms(value: &Value) -> Option<u64> {
    let raw = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => parse_number(s)?,
        _ => return None,
    };
    let ms = if raw >= 100_000_000_000_000_000 {
        raw / 1_000_000
    } else if raw >= 100_000_000_000_000 {
        raw / 1_000
    } else if raw >= 100_000_000_000 {
        raw
    } else {
        raw.saturating_mul(1_000)
    };
    Some(ms)
}

fn parse_number(s: &str) -> Option<u64> {
    let digits: String = s.trim().chars().filter(|c| *c != '_').collect();
    digits.parse().ok()
}
