//! Allow-list mapping from feed snapshots onto persisted rows.
//!
//! Each entity kind has one static table of accepted snapshot keys. A key that
//! is not in the table is reported back as rejected and never stored; a key
//! that is in the table but carries the wrong JSON type fails the whole
//! snapshot. Bump the version constant whenever a table changes.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::db::models::{NewForecast, Storm};
use crate::models::feed::{ForecastSnapshot, StormSnapshot};

pub const STORM_FIELD_MAP_VERSION: u32 = 1;
pub const FORECAST_FIELD_MAP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum MappingError {
    /// A known field carried a value of the wrong shape.
    Field { field: String, reason: String },
    /// Parallel arrays disagree in length after mapping.
    Misaligned { entity: &'static str, lengths: Vec<usize> },
}

impl Display for MappingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::Field { field, reason } => write!(f, "field `{}`: {}", field, reason),
            MappingError::Misaligned { entity, lengths } => {
                write!(f, "{} arrays are not index-aligned (lengths {:?})", entity, lengths)
            }
        }
    }
}

impl Error for MappingError {}

/// Names applied and names refused while mapping one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingReport {
    /// Version of the rule table that produced this report.
    pub version: u32,
    pub applied: Vec<&'static str>,
    pub rejected: Vec<String>,
}

impl MappingReport {
    fn new(version: u32) -> Self {
        MappingReport {
            version,
            applied: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

pub struct FieldRule<T, V: ?Sized> {
    pub name: &'static str,
    pub apply: fn(&mut T, &V) -> Result<(), String>,
}

macro_rules! scalar {
    ($name:literal, $field:ident, $conv:path) => {
        FieldRule {
            name: $name,
            apply: |t, v| {
                t.$field = $conv(v)?;
                Ok(())
            },
        }
    };
}

macro_rules! series {
    ($name:literal, $field:ident, $conv:path) => {
        FieldRule {
            name: $name,
            apply: |t, vs| {
                t.$field = each(vs, $conv)?;
                Ok(())
            },
        }
    };
}

pub static STORM_ATTRIBUTE_RULES: &[FieldRule<Storm, Value>] = &[
    scalar!("operational_id", operational_id, opt_string),
    scalar!("name", name, opt_string),
    scalar!("year", year, opt_i32),
    scalar!("season", season, opt_i32),
    scalar!("basin", basin, opt_string),
    scalar!("source_info", source_info, opt_string),
    scalar!("source_method", source_method, opt_string),
    scalar!("source_url", source_url, opt_string),
    scalar!("source", source, opt_string),
    scalar!("jtwc_source", jtwc_source, opt_string),
    scalar!("ace", ace, opt_f64),
    scalar!("prob_2day", prob_2day, opt_string),
    scalar!("prob_5day", prob_5day, opt_string),
    scalar!("risk_2day", risk_2day, opt_string),
    scalar!("risk_5day", risk_5day, opt_string),
];

pub static STORM_TRACK_RULES: &[FieldRule<Storm, [Value]>] = &[
    series!("date", date, timestamp),
    series!("type", storm_type, string),
    series!("lat", lat, float),
    series!("lon", lon, float),
    series!("vmax", vmax, opt_f64),
    series!("mslp", mslp, opt_f64),
    series!("wmo_basin", wmo_basin, string),
];

pub static FORECAST_SERIES_RULES: &[FieldRule<NewForecast, [Value]>] = &[
    series!("fhr", fhr, int),
    series!("lat", lat, float),
    series!("lon", lon, float),
    series!("vmax", vmax, opt_f64),
    series!("mslp", mslp, opt_f64),
    series!("type", forecast_type, string),
    FieldRule {
        name: "windrad",
        apply: |t, vs| {
            t.windrad = Value::Array(vs.to_vec());
            Ok(())
        },
    },
    series!("cumulative_ace", cumulative_ace, opt_f64),
    series!("cumulative_ace_fhr", cumulative_ace_fhr, int),
];

fn apply_rules<'a, T, V: ?Sized + 'a>(
    target: &mut T,
    rules: &[FieldRule<T, V>],
    entries: impl Iterator<Item = (&'a String, &'a V)>,
    report: &mut MappingReport,
) -> Result<(), MappingError> {
    for (key, value) in entries {
        match rules.iter().find(|r| r.name == key.as_str()) {
            Some(rule) => {
                (rule.apply)(target, value).map_err(|reason| MappingError::Field {
                    field: key.clone(),
                    reason,
                })?;
                report.applied.push(rule.name);
            }
            None => report.rejected.push(key.clone()),
        }
    }
    Ok(())
}

fn series_entries(map: &BTreeMap<String, Vec<Value>>) -> impl Iterator<Item = (&String, &[Value])> {
    map.iter().map(|(k, v)| (k, v.as_slice()))
}

fn ensure_aligned(entity: &'static str, lengths: &[usize]) -> Result<(), MappingError> {
    match lengths.first() {
        Some(first) if lengths.iter().any(|l| l != first) => Err(MappingError::Misaligned {
            entity,
            lengths: lengths.to_vec(),
        }),
        _ => Ok(()),
    }
}

/// Overwrite `storm` with every allow-listed field present in `snapshot`.
///
/// Fields absent from the snapshot keep their current value. Engine-owned
/// columns (`realtime`, `invest`, `update_time`, start/end dates) are always
/// set here and cannot be supplied through the snapshot.
pub fn apply_storm_snapshot(
    storm: &mut Storm,
    snapshot: &StormSnapshot,
    as_of: DateTime<Utc>,
) -> Result<MappingReport, MappingError> {
    let mut report = MappingReport::new(STORM_FIELD_MAP_VERSION);
    apply_rules(storm, STORM_ATTRIBUTE_RULES, snapshot.attributes.iter(), &mut report)?;
    apply_rules(storm, STORM_TRACK_RULES, series_entries(&snapshot.track), &mut report)?;
    ensure_aligned("storm track", &storm.track_lengths())?;

    if storm.date.windows(2).any(|w| w[0] > w[1]) {
        return Err(MappingError::Field {
            field: "date".to_string(),
            reason: "track dates are not in ascending order".to_string(),
        });
    }

    storm.start_date = storm.date.first().copied();
    storm.end_date = storm.date.last().copied();
    storm.invest = snapshot.invest;
    storm.realtime = true;
    storm.update_time = as_of;
    Ok(report)
}

/// Overwrite `forecast` with the snapshot's `init` and allow-listed series.
pub fn apply_forecast_snapshot(
    forecast: &mut NewForecast,
    snapshot: &ForecastSnapshot,
) -> Result<MappingReport, MappingError> {
    let mut report = MappingReport::new(FORECAST_FIELD_MAP_VERSION);
    forecast.init = snapshot.init;
    apply_rules(forecast, FORECAST_SERIES_RULES, series_entries(&snapshot.series), &mut report)?;
    ensure_aligned("forecast", &forecast.hourly_lengths())?;
    ensure_aligned(
        "cumulative ace",
        &[forecast.cumulative_ace.len(), forecast.cumulative_ace_fhr.len()],
    )?;
    Ok(report)
}

fn each<T>(values: &[Value], conv: fn(&Value) -> Result<T, String>) -> Result<Vec<T>, String> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| conv(v).map_err(|e| format!("[{}] {}", i, e)))
        .collect()
}

fn describe(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn opt_string(v: &Value) -> Result<Option<String>, String> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(format!("expected string, got {}", describe(other))),
    }
}

fn string(v: &Value) -> Result<String, String> {
    opt_string(v)?.ok_or_else(|| "expected string, got null".to_string())
}

// Missing readings arrive as null or as a literal NaN string.
fn opt_f64(v: &Value) -> Result<Option<f64>, String> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("number {} is not representable as f64", n)),
        Value::String(s) if s.eq_ignore_ascii_case("nan") => Ok(None),
        other => Err(format!("expected number, got {}", describe(other))),
    }
}

fn float(v: &Value) -> Result<f64, String> {
    opt_f64(v)?.ok_or_else(|| "expected number, got null".to_string())
}

fn opt_i32(v: &Value) -> Result<Option<i32>, String> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => {
            let as_int = n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64));
            as_int
                .and_then(|i| i32::try_from(i).ok())
                .map(Some)
                .ok_or_else(|| format!("{} is not a 32-bit integer", n))
        }
        other => Err(format!("expected integer, got {}", describe(other))),
    }
}

fn int(v: &Value) -> Result<i32, String> {
    opt_i32(v)?.ok_or_else(|| "expected integer, got null".to_string())
}

// Feed dates are either RFC 3339 or naive ISO timestamps that are already UTC.
fn timestamp(v: &Value) -> Result<DateTime<Utc>, String> {
    let s = v
        .as_str()
        .ok_or_else(|| format!("expected timestamp string, got {}", describe(v)))?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("unparseable timestamp `{}`", s))
}
