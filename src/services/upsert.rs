//! Entity upserter: feed snapshot -> storm row -> forecast row -> artifacts.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::path::Path;

use crate::client::{FeedClient, FeedError};
use crate::db::models::{NewForecast, Storm};
use crate::db::store::StormStore;
use crate::mapping::{apply_forecast_snapshot, apply_storm_snapshot};
use crate::models::feed::StormId;
use crate::services::artifacts::{ArtifactReport, generate};
use crate::services::commit::commit_step;

#[derive(Debug, Clone, PartialEq)]
pub enum ForecastOutcome {
    /// Invest storms carry no official forecast.
    NotApplicable,
    /// The feed has no forecast; any stored one is left as is.
    Absent,
    Created,
    Updated,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// The feed no longer serves this storm.
    Unavailable,
    /// The storm row could not be read or committed; nothing else was attempted.
    StormWriteFailed,
    Completed {
        created: bool,
        forecast: ForecastOutcome,
        artifacts: ArtifactReport,
    },
}

/// Create or overwrite one storm from the feed, then its forecast and artifacts.
///
/// Returns `Err` only for feed errors that make the whole run unusable; every
/// other failure is logged and reported through the outcome.
pub fn upsert_storm<S, F>(
    store: &mut S,
    feed: &F,
    media_root: &Path,
    id: &StormId,
    as_of: DateTime<Utc>,
) -> Result<UpsertOutcome, FeedError>
where
    S: StormStore + ?Sized,
    F: FeedClient + ?Sized,
{
    let snapshot = match feed.get_snapshot(id) {
        Ok(snapshot) => snapshot,
        Err(e) if !e.is_fatal() => {
            warn!("Upsert: skipping storm {}: {}", id, e);
            return Ok(UpsertOutcome::Unavailable);
        }
        Err(e) => return Err(e),
    };

    let existing = match store.find_storm(id) {
        Ok(existing) => existing,
        Err(e) => {
            error!("Upsert: looking up storm {} failed: {}", id, e);
            return Ok(UpsertOutcome::StormWriteFailed);
        }
    };
    let created = existing.is_none();
    let mut storm = existing.unwrap_or_else(|| Storm::blank(id, as_of));

    let mapped = apply_storm_snapshot(&mut storm, &snapshot, as_of)
        .map_err(|e| FeedError::Malformed(format!("storm {}: {}", id, e)))?;
    if !mapped.rejected.is_empty() {
        debug!(
            "Upsert: storm {} ignored unknown field(s) under field map v{}: {}",
            id,
            mapped.version,
            mapped.rejected.join(", ")
        );
    }

    let written = if created {
        commit_step(store, "create storm", id, |s| s.insert_storm(&storm))
    } else {
        commit_step(store, "update storm", id, |s| s.update_storm(&storm))
    };
    if written.is_none() {
        return Ok(UpsertOutcome::StormWriteFailed);
    }
    info!(
        "Upsert: {} storm {} ({} track point(s))",
        if created { "created" } else { "updated" },
        id,
        storm.date.len()
    );

    let forecast = if storm.invest {
        ForecastOutcome::NotApplicable
    } else {
        upsert_forecast(store, feed, id)
    };

    let artifacts = generate(store, feed, media_root, &storm, as_of);

    Ok(UpsertOutcome::Completed {
        created,
        forecast,
        artifacts,
    })
}

fn upsert_forecast<S, F>(store: &mut S, feed: &F, id: &StormId) -> ForecastOutcome
where
    S: StormStore + ?Sized,
    F: FeedClient + ?Sized,
{
    let snapshot = match feed.get_forecast_snapshot(id) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            debug!("Upsert: no forecast for {}", id);
            return ForecastOutcome::Absent;
        }
        Err(e) => {
            warn!("Upsert: fetching forecast for {} failed, treating as absent: {}", id, e);
            return ForecastOutcome::Absent;
        }
    };

    let existing = match store.find_forecast(id) {
        Ok(existing) => existing,
        Err(e) => {
            error!("Upsert: looking up forecast for {} failed: {}", id, e);
            return ForecastOutcome::Failed;
        }
    };
    let updating = existing.is_some();
    let mut row = existing
        .map(NewForecast::from)
        .unwrap_or_else(|| NewForecast::blank(id, snapshot.init));

    match apply_forecast_snapshot(&mut row, &snapshot) {
        Ok(mapped) if !mapped.rejected.is_empty() => {
            debug!(
                "Upsert: forecast for {} ignored unknown field(s) under field map v{}: {}",
                id,
                mapped.version,
                mapped.rejected.join(", ")
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!("Upsert: malformed forecast for {}: {}", id, e);
            return ForecastOutcome::Failed;
        }
    }

    let written = if updating {
        commit_step(store, "update forecast", id, |s| s.update_forecast(&row))
    } else {
        commit_step(store, "create forecast", id, |s| s.insert_forecast(&row))
    };
    match (written, updating) {
        (None, _) => ForecastOutcome::Failed,
        (Some(()), true) => ForecastOutcome::Updated,
        (Some(()), false) => ForecastOutcome::Created,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::services::testkit::{FakeFeed, feed_time, forecast_snapshot, storm_snapshot};
    use chrono::Duration;

    fn completed(outcome: UpsertOutcome) -> (bool, ForecastOutcome, ArtifactReport) {
        match outcome {
            UpsertOutcome::Completed {
                created,
                forecast,
                artifacts,
            } => (created, forecast, artifacts),
            other => panic!("expected completed upsert, got {:?}", other),
        }
    }

    #[test]
    fn creates_storm_forecast_and_artifacts() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let feed = FakeFeed::new().with_storm(
            "AL062024",
            storm_snapshot("FRANCINE", "north_atlantic", false),
            Some(forecast_snapshot()),
        );
        let id = StormId::from("AL062024");

        let (created, forecast, artifacts) =
            completed(upsert_storm(&mut store, &feed, media.path(), &id, feed_time()).unwrap());

        assert!(created);
        assert_eq!(forecast, ForecastOutcome::Created);
        assert_eq!(artifacts.cataloged.len(), 4);
        let storm = store.storm("AL062024");
        assert!(storm.realtime);
        assert_eq!(storm.name.as_deref(), Some("FRANCINE"));
        assert_eq!(storm.update_time, feed_time());
        assert_eq!(store.forecasts["AL062024"].fhr, vec![0, 12, 24]);
    }

    #[test]
    fn invest_storms_never_fetch_forecasts() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let feed = FakeFeed::new().with_storm(
            "AL902024",
            storm_snapshot("INVEST", "north_atlantic", true),
            Some(forecast_snapshot()),
        );

        let (_, forecast, _) = completed(
            upsert_storm(&mut store, &feed, media.path(), &StormId::from("AL902024"), feed_time()).unwrap(),
        );

        assert_eq!(forecast, ForecastOutcome::NotApplicable);
        assert!(store.forecasts.is_empty());
    }

    #[test]
    fn missing_forecast_leaves_stale_row() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let id = StormId::from("AL062024");
        let with_forecast = FakeFeed::new().with_storm(
            "AL062024",
            storm_snapshot("FRANCINE", "north_atlantic", false),
            Some(forecast_snapshot()),
        );
        upsert_storm(&mut store, &with_forecast, media.path(), &id, feed_time()).unwrap();

        let without = FakeFeed::new().with_storm("AL062024", storm_snapshot("FRANCINE", "north_atlantic", false), None);
        let (created, forecast, _) =
            completed(upsert_storm(&mut store, &without, media.path(), &id, feed_time()).unwrap());

        assert!(!created);
        assert_eq!(forecast, ForecastOutcome::Absent);
        assert_eq!(store.forecasts.len(), 1);
    }

    #[test]
    fn existing_rows_are_overwritten_in_place() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let id = StormId::from("AL062024");
        let first = FakeFeed::new().with_storm(
            "AL062024",
            storm_snapshot("SIX", "north_atlantic", false),
            Some(forecast_snapshot()),
        );
        upsert_storm(&mut store, &first, media.path(), &id, feed_time()).unwrap();

        let mut later_forecast = forecast_snapshot();
        later_forecast.init = feed_time();
        let second = FakeFeed::new().with_storm(
            "AL062024",
            storm_snapshot("FRANCINE", "north_atlantic", false),
            Some(later_forecast),
        );
        let later = feed_time() + Duration::hours(6);
        let (created, forecast, _) = completed(upsert_storm(&mut store, &second, media.path(), &id, later).unwrap());

        assert!(!created);
        assert_eq!(forecast, ForecastOutcome::Updated);
        assert_eq!(store.storms.len(), 1);
        assert_eq!(store.storm("AL062024").name.as_deref(), Some("FRANCINE"));
        assert_eq!(store.storm("AL062024").update_time, later);
        assert_eq!(store.forecasts["AL062024"].init, feed_time());
    }

    #[test]
    fn storm_commit_failure_abandons_remaining_steps() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        store.fail("insert_storm");
        let feed = FakeFeed::new().with_storm(
            "AL062024",
            storm_snapshot("FRANCINE", "north_atlantic", false),
            Some(forecast_snapshot()),
        );

        let outcome = upsert_storm(&mut store, &feed, media.path(), &StormId::from("AL062024"), feed_time()).unwrap();

        assert_eq!(outcome, UpsertOutcome::StormWriteFailed);
        assert!(store.storms.is_empty());
        assert!(store.forecasts.is_empty());
        assert!(feed.renders.borrow().is_empty());
    }

    #[test]
    fn forecast_commit_failure_still_generates_artifacts() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        store.fail("insert_forecast");
        let feed = FakeFeed::new().with_storm(
            "AL062024",
            storm_snapshot("FRANCINE", "north_atlantic", false),
            Some(forecast_snapshot()),
        );

        let (_, forecast, artifacts) = completed(
            upsert_storm(&mut store, &feed, media.path(), &StormId::from("AL062024"), feed_time()).unwrap(),
        );

        assert_eq!(forecast, ForecastOutcome::Failed);
        assert_eq!(artifacts.cataloged.len(), 4);
    }

    #[test]
    fn unavailable_snapshot_skips_storm() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let feed = FakeFeed::new();

        let outcome = upsert_storm(&mut store, &feed, media.path(), &StormId::from("AL012024"), feed_time()).unwrap();

        assert_eq!(outcome, UpsertOutcome::Unavailable);
        assert!(store.storms.is_empty());
    }

    #[test]
    fn malformed_snapshot_is_fatal() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let mut snapshot = storm_snapshot("FRANCINE", "north_atlantic", false);
        snapshot.track.get_mut("lon").unwrap().push(serde_json::json!(-92.0));
        let feed = FakeFeed::new().with_storm("AL062024", snapshot, None);

        let err = upsert_storm(&mut store, &feed, media.path(), &StormId::from("AL062024"), feed_time()).unwrap_err();

        assert!(matches!(err, FeedError::Malformed(_)));
        assert!(store.storms.is_empty());
    }
}
