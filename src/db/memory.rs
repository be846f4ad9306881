//! In-memory `StormStore` for engine tests, with per-operation fault injection.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::db::models::{
    Forecast, NewForecast, NewStormPlot, NewSummaryPlotFile, Storm, StormPlot, SummaryPlot, SummaryPlotFile,
};
use crate::db::store::{StoreError, StormStore};
use crate::models::feed::StormId;

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub storms: BTreeMap<String, Storm>,
    pub forecasts: BTreeMap<String, Forecast>,
    pub plots: Vec<StormPlot>,
    pub summaries: Vec<SummaryPlot>,
    pub summary_files: Vec<SummaryPlotFile>,
    /// Ids passed to a successful `retire_storm`, in call order.
    pub retirements: Vec<StormId>,
    failing: BTreeSet<&'static str>,
    failing_basins: BTreeSet<String>,
    next_id: i64,
}

fn rejected() -> StoreError {
    StoreError::Database(diesel::result::Error::RollbackTransaction)
}

impl MemoryStore {
    /// Make every call of the named trait method fail until `heal` is called.
    pub fn fail(&mut self, op: &'static str) {
        self.failing.insert(op);
    }

    pub fn heal(&mut self, op: &'static str) {
        self.failing.remove(op);
    }

    /// Fail summary child inserts for one basin only.
    pub fn fail_summary_basin(&mut self, basin: &str) {
        self.failing_basins.insert(basin.to_string());
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        if self.failing.contains(op) { Err(rejected()) } else { Ok(()) }
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn storm(&self, id: &str) -> &Storm {
        &self.storms[id]
    }

    pub fn plots_for(&self, id: &str) -> Vec<&StormPlot> {
        self.plots.iter().filter(|p| p.storm_id == id).collect()
    }
}

impl StormStore for MemoryStore {
    fn realtime_storm_ids(&mut self) -> Result<BTreeSet<StormId>, StoreError> {
        self.check("realtime_storm_ids")?;
        Ok(self
            .storms
            .values()
            .filter(|s| s.realtime)
            .map(|s| StormId(s.id.clone()))
            .collect())
    }

    fn find_storm(&mut self, id: &StormId) -> Result<Option<Storm>, StoreError> {
        self.check("find_storm")?;
        Ok(self.storms.get(id.as_str()).cloned())
    }

    fn insert_storm(&mut self, storm: &Storm) -> Result<(), StoreError> {
        self.check("insert_storm")?;
        if self.storms.contains_key(&storm.id) {
            return Err(rejected());
        }
        self.storms.insert(storm.id.clone(), storm.clone());
        Ok(())
    }

    fn update_storm(&mut self, storm: &Storm) -> Result<(), StoreError> {
        self.check("update_storm")?;
        match self.storms.get_mut(&storm.id) {
            Some(row) => {
                *row = storm.clone();
                Ok(())
            }
            None => Err(StoreError::Database(diesel::result::Error::NotFound)),
        }
    }

    fn retire_storm(&mut self, id: &StormId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check("retire_storm")?;
        let row = self
            .storms
            .get_mut(id.as_str())
            .ok_or(StoreError::Database(diesel::result::Error::NotFound))?;
        row.realtime = false;
        row.update_time = at;
        self.retirements.push(id.clone());
        Ok(())
    }

    fn find_forecast(&mut self, storm_id: &StormId) -> Result<Option<Forecast>, StoreError> {
        self.check("find_forecast")?;
        Ok(self.forecasts.get(storm_id.as_str()).cloned())
    }

    fn insert_forecast(&mut self, forecast: &NewForecast) -> Result<(), StoreError> {
        self.check("insert_forecast")?;
        if self.forecasts.contains_key(&forecast.storm_id) {
            return Err(rejected());
        }
        let id = self.next_id();
        let f = forecast.clone();
        self.forecasts.insert(
            f.storm_id.clone(),
            Forecast {
                id,
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
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn update_forecast(&mut self, forecast: &NewForecast) -> Result<(), StoreError> {
        self.check("update_forecast")?;
        let row = self
            .forecasts
            .get_mut(&forecast.storm_id)
            .ok_or(StoreError::Database(diesel::result::Error::NotFound))?;
        let f = forecast.clone();
        row.init = f.init;
        row.fhr = f.fhr;
        row.lat = f.lat;
        row.lon = f.lon;
        row.vmax = f.vmax;
        row.mslp = f.mslp;
        row.forecast_type = f.forecast_type;
        row.windrad = f.windrad;
        row.cumulative_ace = f.cumulative_ace;
        row.cumulative_ace_fhr = f.cumulative_ace_fhr;
        row.updated_at = Utc::now();
        Ok(())
    }

    fn insert_storm_plot(&mut self, plot: &NewStormPlot) -> Result<(), StoreError> {
        self.check("insert_storm_plot")?;
        let existing = self.plots.iter_mut().find(|p| {
            p.storm_id == plot.storm_id && p.updated_on == plot.updated_on && p.plot_type == plot.plot_type
        });
        match existing {
            Some(row) => row.file_path = plot.file_path.clone(),
            None => {
                let id = self.next_id();
                self.plots.push(StormPlot {
                    id,
                    storm_id: plot.storm_id.clone(),
                    updated_on: plot.updated_on,
                    plot_type: plot.plot_type.clone(),
                    file_path: plot.file_path.clone(),
                });
            }
        }
        Ok(())
    }

    fn storm_plots(&mut self, storm_id: &StormId) -> Result<Vec<StormPlot>, StoreError> {
        self.check("storm_plots")?;
        Ok(self
            .plots
            .iter()
            .filter(|p| p.storm_id == storm_id.as_str())
            .cloned()
            .collect())
    }

    fn delete_storm_plot(&mut self, plot_id: i64) -> Result<(), StoreError> {
        self.check("delete_storm_plot")?;
        self.plots.retain(|p| p.id != plot_id);
        Ok(())
    }

    fn realtime_basins(&mut self) -> Result<BTreeSet<String>, StoreError> {
        self.check("realtime_basins")?;
        Ok(self
            .storms
            .values()
            .filter(|s| s.realtime)
            .filter_map(|s| s.basin.clone())
            .collect())
    }

    fn insert_summary_plot(&mut self, plot: &SummaryPlot) -> Result<(), StoreError> {
        self.check("insert_summary_plot")?;
        if self.summaries.iter().any(|s| s.id == plot.id) {
            return Err(rejected());
        }
        self.summaries.push(plot.clone());
        Ok(())
    }

    fn insert_summary_plot_file(&mut self, file: &NewSummaryPlotFile) -> Result<(), StoreError> {
        self.check("insert_summary_plot_file")?;
        if self.failing_basins.contains(&file.basin) {
            return Err(rejected());
        }
        let id = self.next_id();
        self.summary_files.push(SummaryPlotFile {
            id,
            plot_id: file.plot_id.clone(),
            basin: file.basin.clone(),
            file_path: file.file_path.clone(),
        });
        Ok(())
    }

    fn summary_plot_files(&mut self, plot_id: &str) -> Result<Vec<SummaryPlotFile>, StoreError> {
        self.check("summary_plot_files")?;
        Ok(self
            .summary_files
            .iter()
            .filter(|f| f.plot_id == plot_id)
            .cloned()
            .collect())
    }
}
