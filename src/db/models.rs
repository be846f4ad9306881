//! Diesel row structs for storms, forecasts and the plot catalogs.
//!
//! `storms.id` is the feed's own identifier and is never generated locally.
//! Track columns are parallel arrays sharing one length, ordered by `date`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::feed::{ArtifactKind, StormId};
use crate::schema;

#[derive(
    Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Insertable, AsChangeset, Serialize, Deserialize,
)]
#[diesel(table_name = schema::storms)]
#[diesel(treat_none_as_null = true)]
pub struct Storm {
    pub id: String,
    pub operational_id: Option<String>,
    pub name: Option<String>,
    pub year: Option<i32>,
    pub season: Option<i32>,
    pub basin: Option<String>,
    pub source_info: Option<String>,
    pub source_method: Option<String>,
    pub source_url: Option<String>,
    pub source: Option<String>,
    pub jtwc_source: Option<String>,
    pub ace: Option<f64>,
    pub prob_2day: Option<String>,
    pub prob_5day: Option<String>,
    pub risk_2day: Option<String>,
    pub risk_5day: Option<String>,
    pub realtime: bool,
    pub invest: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
    pub date: Vec<DateTime<Utc>>,
    pub storm_type: Vec<String>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub vmax: Vec<Option<f64>>,
    pub mslp: Vec<Option<f64>>,
    pub wmo_basin: Vec<String>,
}

impl Storm {
    /// An empty record for a storm seen for the first time.
    pub fn blank(id: &StormId, update_time: DateTime<Utc>) -> Self {
        Storm {
            id: id.0.clone(),
            operational_id: None,
            name: None,
            year: None,
            season: None,
            basin: None,
            source_info: None,
            source_method: None,
            source_url: None,
            source: None,
            jtwc_source: None,
            ace: None,
            prob_2day: None,
            prob_5day: None,
            risk_2day: None,
            risk_5day: None,
            realtime: true,
            invest: false,
            start_date: None,
            end_date: None,
            update_time,
            date: Vec::new(),
            storm_type: Vec::new(),
            lat: Vec::new(),
            lon: Vec::new(),
            vmax: Vec::new(),
            mslp: Vec::new(),
            wmo_basin: Vec::new(),
        }
    }

    pub fn storm_id(&self) -> StormId {
        StormId(self.id.clone())
    }

    /// Lengths of every track array, in column order.
    pub fn track_lengths(&self) -> [usize; 7] {
        [
            self.date.len(),
            self.storm_type.len(),
            self.lat.len(),
            self.lon.len(),
            self.vmax.len(),
            self.mslp.len(),
            self.wmo_basin.len(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = schema::storm_forecasts)]
pub struct Forecast {
    pub id: i64,
    pub storm_id: String,
    pub init: DateTime<Utc>,
    pub fhr: Vec<i32>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub vmax: Vec<Option<f64>>,
    pub mslp: Vec<Option<f64>>,
    pub forecast_type: Vec<String>,
    pub windrad: serde_json::Value,
    pub cumulative_ace: Vec<Option<f64>>,
    pub cumulative_ace_fhr: Vec<i32>,
    pub updated_at: DateTime<Utc>,
}

/// Insert and overwrite shape of a forecast; `updated_at` is stamped by the store.
#[derive(Debug, Clone, PartialEq, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = schema::storm_forecasts)]
pub struct NewForecast {
    pub storm_id: String,
    pub init: DateTime<Utc>,
    pub fhr: Vec<i32>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub vmax: Vec<Option<f64>>,
    pub mslp: Vec<Option<f64>>,
    pub forecast_type: Vec<String>,
    pub windrad: serde_json::Value,
    pub cumulative_ace: Vec<Option<f64>>,
    pub cumulative_ace_fhr: Vec<i32>,
}

impl NewForecast {
    pub fn blank(storm_id: &StormId, init: DateTime<Utc>) -> Self {
        NewForecast {
            storm_id: storm_id.0.clone(),
            init,
            fhr: Vec::new(),
            lat: Vec::new(),
            lon: Vec::new(),
            vmax: Vec::new(),
            mslp: Vec::new(),
            forecast_type: Vec::new(),
            windrad: serde_json::Value::Array(Vec::new()),
            cumulative_ace: Vec::new(),
            cumulative_ace_fhr: Vec::new(),
        }
    }

    /// Lengths of the per-forecast-hour arrays; `windrad` counts when it is an array.
    pub fn hourly_lengths(&self) -> Vec<usize> {
        let mut lengths = vec![
            self.fhr.len(),
            self.lat.len(),
            self.lon.len(),
            self.vmax.len(),
            self.mslp.len(),
            self.forecast_type.len(),
        ];
        if let Some(radii) = self.windrad.as_array() {
            lengths.push(radii.len());
        }
        lengths
    }
}

impl From<Forecast> for NewForecast {
    fn from(f: Forecast) -> Self {
        NewForecast {
            storm_id: f.storm_id,
            init: f.init,
            fhr: f.fhr,
            lat: f.lat,
            lon: f.lon,
            vmax: f.vmax,
            mslp: f.mslp,
            forecast_type: f.forecast_type,
            windrad: f.windrad,
            cumulative_ace: f.cumulative_ace,
            cumulative_ace_fhr: f.cumulative_ace_fhr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = schema::storm_plots)]
pub struct StormPlot {
    pub id: i64,
    pub storm_id: String,
    pub updated_on: DateTime<Utc>,
    pub plot_type: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::storm_plots)]
pub struct NewStormPlot {
    pub storm_id: String,
    pub updated_on: DateTime<Utc>,
    pub plot_type: String,
    pub file_path: String,
}

impl NewStormPlot {
    pub fn new(storm_id: &StormId, updated_on: DateTime<Utc>, kind: ArtifactKind, file_path: String) -> Self {
        NewStormPlot {
            storm_id: storm_id.0.clone(),
            updated_on,
            plot_type: kind.as_str().to_string(),
            file_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::summary_plots)]
pub struct SummaryPlot {
    pub id: String,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Associations, Serialize, Deserialize)]
#[diesel(table_name = schema::summary_plot_files)]
#[diesel(belongs_to(SummaryPlot, foreign_key = plot_id))]
pub struct SummaryPlotFile {
    pub id: i64,
    pub plot_id: String,
    pub basin: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::summary_plot_files)]
pub struct NewSummaryPlotFile {
    pub plot_id: String,
    pub basin: String,
    pub file_path: String,
}
