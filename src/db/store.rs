//! Persistence seam used by the engine.
//!
//! Every mutating method is one short transaction: it either commits as a
//! whole or leaves the store as it was. Nothing here spans entities.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::db::models::{
    Forecast, NewForecast, NewStormPlot, NewSummaryPlotFile, Storm, StormPlot, SummaryPlot, SummaryPlotFile,
};
use crate::models::feed::StormId;

#[derive(Debug)]
pub enum StoreError {
    Connection(String),
    Database(diesel::result::Error),
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::Connection(s) => write!(f, "connection error: {}", s),
            StoreError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Connection(_) => None,
        }
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Database(value)
    }
}

pub trait StormStore {
    fn realtime_storm_ids(&mut self) -> Result<BTreeSet<StormId>, StoreError>;
    fn find_storm(&mut self, id: &StormId) -> Result<Option<Storm>, StoreError>;
    fn insert_storm(&mut self, storm: &Storm) -> Result<(), StoreError>;
    fn update_storm(&mut self, storm: &Storm) -> Result<(), StoreError>;
    /// Flip `realtime` off and stamp `update_time`; the row itself is kept.
    fn retire_storm(&mut self, id: &StormId, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn find_forecast(&mut self, storm_id: &StormId) -> Result<Option<Forecast>, StoreError>;
    fn insert_forecast(&mut self, forecast: &NewForecast) -> Result<(), StoreError>;
    fn update_forecast(&mut self, forecast: &NewForecast) -> Result<(), StoreError>;

    /// Catalog an artifact; a row with the same (storm, as-of, kind) is overwritten.
    fn insert_storm_plot(&mut self, plot: &NewStormPlot) -> Result<(), StoreError>;
    fn storm_plots(&mut self, storm_id: &StormId) -> Result<Vec<StormPlot>, StoreError>;
    fn delete_storm_plot(&mut self, plot_id: i64) -> Result<(), StoreError>;

    /// Distinct non-null basins of all realtime storms.
    fn realtime_basins(&mut self) -> Result<BTreeSet<String>, StoreError>;
    fn insert_summary_plot(&mut self, plot: &SummaryPlot) -> Result<(), StoreError>;
    fn insert_summary_plot_file(&mut self, file: &NewSummaryPlotFile) -> Result<(), StoreError>;
    fn summary_plot_files(&mut self, plot_id: &str) -> Result<Vec<SummaryPlotFile>, StoreError>;
}
