//! Wire types exchanged with the storm feed and its renderer.
//!
//! Snapshots are deliberately loose (`serde_json::Value` per field): which
//! keys are accepted and how they are typed is decided by `crate::mapping`,
//! not by deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Feed-assigned storm identifier (e.g. `AL052024`, `WP182024`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StormId(pub String);

impl StormId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StormId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StormId {
    fn from(value: &str) -> Self {
        StormId(value.to_string())
    }
}

/// The feed's view of which storms are active right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeIndex {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub storms: Vec<StormId>,
}

/// One storm as reported by the feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StormSnapshot {
    /// Scalar attributes (name, year, basin, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Parallel per-observation sequences (date, lat, lon, vmax, ...).
    #[serde(default)]
    pub track: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub invest: bool,
}

/// Official forecast track for a storm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub init: DateTime<Utc>,
    /// Parallel sequences keyed by field name (fhr, lat, lon, vmax, ...).
    #[serde(default)]
    pub series: BTreeMap<String, Vec<Value>>,
}

/// Categories of per-storm map product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    ObservedTrack,
    LatestForecast,
    ForecastModelTracks,
    ForecastGefsDensity,
    ForecastGefsTracks,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::ObservedTrack,
        ArtifactKind::LatestForecast,
        ArtifactKind::ForecastModelTracks,
        ArtifactKind::ForecastGefsDensity,
        ArtifactKind::ForecastGefsTracks,
    ];

    /// Stable name used in file names and in the `plot_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::ObservedTrack => "observed_track",
            ArtifactKind::LatestForecast => "latest_forecast",
            ArtifactKind::ForecastModelTracks => "forecast_model_tracks",
            ArtifactKind::ForecastGefsDensity => "forecast_gefs_density",
            ArtifactKind::ForecastGefsTracks => "forecast_gefs_tracks",
        }
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderProduct {
    Storm(ArtifactKind),
    BasinSummary,
}

impl RenderProduct {
    pub fn name(&self) -> &'static str {
        match self {
            RenderProduct::Storm(kind) => kind.as_str(),
            RenderProduct::BasinSummary => "basin_summary",
        }
    }
}

/// What to draw. `domain` narrows the map extent (a basin name for summaries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub product: RenderProduct,
    pub storm_id: Option<StormId>,
    pub domain: Option<String>,
}

impl RenderRequest {
    pub fn storm(kind: ArtifactKind, storm_id: &StormId) -> Self {
        RenderRequest {
            product: RenderProduct::Storm(kind),
            storm_id: Some(storm_id.clone()),
            domain: None,
        }
    }

    pub fn basin_summary(basin: &str) -> Self {
        RenderRequest {
            product: RenderProduct::BasinSummary,
            storm_id: None,
            domain: Some(basin.to_string()),
        }
    }
}

/// Where rendered output goes: a single image, or a directory receiving
/// every file of a multi-file product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderTarget {
    File(PathBuf),
    Directory(PathBuf),
}
