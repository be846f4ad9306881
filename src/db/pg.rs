//! Postgres-backed `StormStore` (diesel, blocking).

use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::result::QueryResult;
use std::collections::BTreeSet;

use crate::db::models::{
    Forecast, NewForecast, NewStormPlot, NewSummaryPlotFile, Storm, StormPlot, SummaryPlot, SummaryPlotFile,
};
use crate::db::store::{StoreError, StormStore};
use crate::models::feed::StormId;
use crate::schema;

pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub fn new(conn: PgConnection) -> Self {
        PgStore { conn }
    }

    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        PgConnection::establish(database_url)
            .map(PgStore::new)
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    /// Commit-or-rollback boundary shared by every write below.
    fn write<T>(&mut self, f: impl FnOnce(&mut PgConnection) -> QueryResult<T>) -> Result<T, StoreError> {
        self.conn.transaction(f).map_err(StoreError::from)
    }
}

// Updates addressed by key must hit exactly one row; anything else rolls back.
fn expect_one(affected: usize) -> QueryResult<()> {
    match affected {
        1 => Ok(()),
        0 => Err(diesel::result::Error::NotFound),
        _ => Err(diesel::result::Error::RollbackTransaction),
    }
}

impl StormStore for PgStore {
    fn realtime_storm_ids(&mut self) -> Result<BTreeSet<StormId>, StoreError> {
        use schema::storms::dsl as S;

        let ids: Vec<String> = S::storms
            .filter(S::realtime.eq(true))
            .select(S::id)
            .load(&mut self.conn)?;
        Ok(ids.into_iter().map(StormId).collect())
    }

    fn find_storm(&mut self, id: &StormId) -> Result<Option<Storm>, StoreError> {
        use schema::storms::dsl as S;

        let storm = S::storms
            .find(id.as_str())
            .select(Storm::as_select())
            .first(&mut self.conn)
            .optional()?;
        Ok(storm)
    }

    fn insert_storm(&mut self, storm: &Storm) -> Result<(), StoreError> {
        use schema::storms::dsl as S;

        self.write(|c| diesel::insert_into(S::storms).values(storm).execute(c).map(|_| ()))
    }

    fn update_storm(&mut self, storm: &Storm) -> Result<(), StoreError> {
        use schema::storms::dsl as S;

        self.write(|c| {
            let affected = diesel::update(S::storms.find(storm.id.as_str())).set(storm).execute(c)?;
            expect_one(affected)
        })
    }

    fn retire_storm(&mut self, id: &StormId, at: DateTime<Utc>) -> Result<(), StoreError> {
        use schema::storms::dsl as S;

        self.write(|c| {
            let affected = diesel::update(S::storms.find(id.as_str()))
                .set((S::realtime.eq(false), S::update_time.eq(at)))
                .execute(c)?;
            expect_one(affected)
        })
    }

    fn find_forecast(&mut self, storm_id: &StormId) -> Result<Option<Forecast>, StoreError> {
        use schema::storm_forecasts::dsl as F;

        let forecast = F::storm_forecasts
            .filter(F::storm_id.eq(storm_id.as_str()))
            .select(Forecast::as_select())
            .first(&mut self.conn)
            .optional()?;
        Ok(forecast)
    }

    fn insert_forecast(&mut self, forecast: &NewForecast) -> Result<(), StoreError> {
        use schema::storm_forecasts::dsl as F;

        self.write(|c| {
            diesel::insert_into(F::storm_forecasts)
                .values(forecast)
                .execute(c)
                .map(|_| ())
        })
    }

    fn update_forecast(&mut self, forecast: &NewForecast) -> Result<(), StoreError> {
        use schema::storm_forecasts::dsl as F;

        let storm_id = forecast.storm_id.as_str();
        self.write(|c| {
            let affected = diesel::update(F::storm_forecasts.filter(F::storm_id.eq(storm_id)))
                .set(forecast)
                .execute(c)?;
            expect_one(affected)?;
            diesel::update(F::storm_forecasts.filter(F::storm_id.eq(storm_id)))
                .set(F::updated_at.eq(Utc::now()))
                .execute(c)
                .map(|_| ())
        })
    }

    fn insert_storm_plot(&mut self, plot: &NewStormPlot) -> Result<(), StoreError> {
        use schema::storm_plots::dsl as P;

        self.write(|c| {
            diesel::insert_into(P::storm_plots)
                .values(plot)
                .on_conflict((P::storm_id, P::updated_on, P::plot_type))
                .do_update()
                .set(P::file_path.eq(plot.file_path.as_str()))
                .execute(c)
                .map(|_| ())
        })
    }

    fn storm_plots(&mut self, storm_id: &StormId) -> Result<Vec<StormPlot>, StoreError> {
        use schema::storm_plots::dsl as P;

        let plots = P::storm_plots
            .filter(P::storm_id.eq(storm_id.as_str()))
            .order(P::id.asc())
            .select(StormPlot::as_select())
            .load(&mut self.conn)?;
        Ok(plots)
    }

    fn delete_storm_plot(&mut self, plot_id: i64) -> Result<(), StoreError> {
        use schema::storm_plots::dsl as P;

        self.write(|c| diesel::delete(P::storm_plots.find(plot_id)).execute(c).map(|_| ()))
    }

    fn realtime_basins(&mut self) -> Result<BTreeSet<String>, StoreError> {
        use schema::storms::dsl as S;

        let basins: Vec<Option<String>> = S::storms
            .filter(S::realtime.eq(true))
            .filter(S::basin.is_not_null())
            .select(S::basin)
            .distinct()
            .load(&mut self.conn)?;
        Ok(basins.into_iter().flatten().collect())
    }

    fn insert_summary_plot(&mut self, plot: &SummaryPlot) -> Result<(), StoreError> {
        use schema::summary_plots::dsl as SP;

        self.write(|c| diesel::insert_into(SP::summary_plots).values(plot).execute(c).map(|_| ()))
    }

    fn insert_summary_plot_file(&mut self, file: &NewSummaryPlotFile) -> Result<(), StoreError> {
        use schema::summary_plot_files::dsl as SF;

        self.write(|c| {
            diesel::insert_into(SF::summary_plot_files)
                .values(file)
                .execute(c)
                .map(|_| ())
        })
    }

    fn summary_plot_files(&mut self, plot_id: &str) -> Result<Vec<SummaryPlotFile>, StoreError> {
        use schema::summary_plots::dsl as SP;

        let parent: SummaryPlot = SP::summary_plots
            .find(plot_id)
            .select(SummaryPlot::as_select())
            .first(&mut self.conn)?;
        let files = SummaryPlotFile::belonging_to(&parent)
            .select(SummaryPlotFile::as_select())
            .load(&mut self.conn)?;
        Ok(files)
    }
}
