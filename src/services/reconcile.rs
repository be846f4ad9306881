//! Reconciler: align the store's realtime set with the feed's active set.

use log::{error, info, warn};
use std::collections::BTreeSet;
use std::path::Path;

use crate::client::FeedClient;
use crate::db::store::StormStore;
use crate::errors::EngineError;
use crate::models::feed::StormId;
use crate::services::commit::commit_step;
use crate::services::retire;
use crate::services::upsert::{UpsertOutcome, upsert_storm};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub retired: Vec<StormId>,
    /// Retirements whose commit failed; retried on the next run.
    pub retire_failed: Vec<StormId>,
    pub created: Vec<StormId>,
    pub updated: Vec<StormId>,
    /// Active ids that were skipped (unavailable snapshot or failed storm write).
    pub skipped: Vec<StormId>,
}

/// One reconciliation pass.
///
/// Only feed-level failures are returned; they stop the pass where it is and
/// leave already committed storms as they are. Everything else is logged and
/// absorbed per storm.
pub fn reconcile<S, F>(store: &mut S, feed: &F, media_root: &Path) -> Result<ReconcileReport, EngineError>
where
    S: StormStore + ?Sized,
    F: FeedClient + ?Sized,
{
    let mut report = ReconcileReport::default();

    let active = feed.list_active_storms().map_err(fatal)?;
    let as_of = feed.current_snapshot_time().map_err(fatal)?;

    let realtime = match store.realtime_storm_ids() {
        Ok(ids) => ids,
        Err(e) => {
            error!("Reconcile: reading realtime storms failed, skipping run: {}", e);
            return Ok(report);
        }
    };

    let retiring: BTreeSet<&StormId> = realtime.difference(&active).collect();
    info!(
        "Reconcile: as_of={} active={} realtime={} retiring={}",
        as_of,
        active.len(),
        realtime.len(),
        retiring.len()
    );

    for id in retiring {
        match commit_step(store, "retire storm", id, |s| s.retire_storm(id, as_of)) {
            Some(()) => {
                retire::cleanup(store, media_root, id);
                report.retired.push(id.clone());
            }
            None => report.retire_failed.push(id.clone()),
        }
    }

    for id in &active {
        match upsert_storm(store, feed, media_root, id, as_of).map_err(fatal)? {
            UpsertOutcome::Completed { created: true, .. } => report.created.push(id.clone()),
            UpsertOutcome::Completed { created: false, .. } => report.updated.push(id.clone()),
            UpsertOutcome::Unavailable | UpsertOutcome::StormWriteFailed => report.skipped.push(id.clone()),
        }
    }

    info!(
        "Reconcile: done (created={}, updated={}, retired={}, skipped={}, retire_failed={})",
        report.created.len(),
        report.updated.len(),
        report.retired.len(),
        report.skipped.len(),
        report.retire_failed.len()
    );
    if !report.retire_failed.is_empty() {
        warn!("Reconcile: {} retirement(s) will be retried next run", report.retire_failed.len());
    }
    Ok(report)
}

fn fatal(e: crate::client::FeedError) -> EngineError {
    error!("Reconcile: aborting run, feed unusable: {}", e);
    EngineError::FatalFeed(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::models::Storm;
    use crate::models::feed::ArtifactKind;
    use crate::services::artifacts::storm_plot_path;
    use crate::services::testkit::{FakeFeed, feed_time, forecast_snapshot, storm_snapshot};
    use chrono::Duration;
    use std::fs;

    fn feed_with(ids: &[&str]) -> FakeFeed {
        ids.iter().fold(FakeFeed::new(), |feed, id| {
            feed.with_storm(id, storm_snapshot(id, "west_pacific", false), Some(forecast_snapshot()))
        })
    }

    fn realtime(store: &mut MemoryStore) -> Vec<String> {
        store
            .realtime_storm_ids()
            .unwrap()
            .into_iter()
            .map(|id| id.0)
            .collect()
    }

    #[test]
    fn second_run_on_unchanged_feed_changes_nothing() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let feed = feed_with(&["WP012024", "WP022024"]);

        reconcile(&mut store, &feed, media.path()).unwrap();
        let storms = store.storms.clone();
        let forecasts: Vec<_> = store.forecasts.values().map(|f| (f.storm_id.clone(), f.fhr.clone())).collect();
        let plots = store.plots.clone();

        let report = reconcile(&mut store, &feed, media.path()).unwrap();

        assert_eq!(report.updated.len(), 2);
        assert!(report.created.is_empty());
        assert_eq!(store.storms, storms);
        assert_eq!(
            store.forecasts.values().map(|f| (f.storm_id.clone(), f.fhr.clone())).collect::<Vec<_>>(),
            forecasts
        );
        assert_eq!(store.plots, plots);
    }

    #[test]
    fn retires_creates_and_updates_in_one_pass() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let first = feed_with(&["B", "C"]);
        reconcile(&mut store, &first, media.path()).unwrap();
        assert!(media.path().join("storm_plots/C").exists());

        let mut second = feed_with(&["A", "B"]);
        second.time = Some(feed_time() + Duration::hours(1));
        let report = reconcile(&mut store, &second, media.path()).unwrap();

        assert_eq!(report.retired, vec![StormId::from("C")]);
        assert_eq!(report.created, vec![StormId::from("A")]);
        assert_eq!(report.updated, vec![StormId::from("B")]);
        assert_eq!(realtime(&mut store), vec!["A", "B"]);

        let c = store.storm("C");
        assert!(!c.realtime);
        assert_eq!(c.update_time, feed_time() + Duration::hours(1));
        assert!(store.plots_for("C").is_empty());
        assert!(!media.path().join("storm_plots/C").exists());
        assert_eq!(store.storm("B").update_time, feed_time() + Duration::hours(1));
        assert!(store.forecasts.contains_key("A"));
    }

    #[test]
    fn retired_storm_is_retired_once_and_gets_no_new_artifacts() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        reconcile(&mut store, &feed_with(&["A", "C"]), media.path()).unwrap();

        let without_c = feed_with(&["A"]);
        reconcile(&mut store, &without_c, media.path()).unwrap();
        reconcile(&mut store, &without_c, media.path()).unwrap();

        assert_eq!(store.retirements, vec![StormId::from("C")]);
        assert!(store.plots_for("C").is_empty());
        assert!(!without_c.snapshot_fetches.borrow().contains(&StormId::from("C")));
    }

    #[test]
    fn new_storm_gets_one_row_each() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let feed = feed_with(&["EP052024"]);

        let report = reconcile(&mut store, &feed, media.path()).unwrap();

        assert_eq!(report.created, vec![StormId::from("EP052024")]);
        assert_eq!(store.storms.len(), 1);
        assert_eq!(store.forecasts.len(), 1);
        // observed_track, latest_forecast, model tracks, gefs density; gefs tracks is inert
        assert_eq!(store.plots_for("EP052024").len(), 4);
    }

    #[test]
    fn failed_render_kind_leaves_other_kinds_cataloged() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let mut feed = feed_with(&["EP052024"]);
        feed.fail_product(ArtifactKind::ForecastModelTracks.as_str());

        reconcile(&mut store, &feed, media.path()).unwrap();

        let kinds: Vec<&str> = store.plots_for("EP052024").iter().map(|p| p.plot_type.as_str()).collect();
        assert_eq!(kinds, vec!["observed_track", "latest_forecast", "forecast_gefs_density"]);
    }

    #[test]
    fn unreachable_feed_aborts_before_any_mutation() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        reconcile(&mut store, &feed_with(&["A"]), media.path()).unwrap();
        let before = store.storms.clone();

        let mut feed = FakeFeed::new();
        feed.unreachable = true;
        let err = reconcile(&mut store, &feed, media.path()).unwrap_err();

        assert!(matches!(err, EngineError::FatalFeed(_)));
        assert_eq!(store.storms, before);
        assert!(store.retirements.is_empty());
    }

    #[test]
    fn malformed_snapshot_mid_run_keeps_earlier_storms() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let mut feed = feed_with(&["A", "B", "C"]);
        feed.malformed.insert(StormId::from("B"));

        let err = reconcile(&mut store, &feed, media.path()).unwrap_err();

        assert!(matches!(err, EngineError::FatalFeed(_)));
        assert!(store.storms.contains_key("A"));
        assert!(!store.storms.contains_key("B"));
        assert!(!store.storms.contains_key("C"));
    }

    #[test]
    fn unavailable_storm_is_skipped_and_run_continues() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let mut feed = feed_with(&["A", "C"]);
        feed.active.insert(StormId::from("B"));

        let report = reconcile(&mut store, &feed, media.path()).unwrap();

        assert_eq!(report.skipped, vec![StormId::from("B")]);
        assert_eq!(report.created, vec![StormId::from("A"), StormId::from("C")]);
    }

    #[test]
    fn failed_retire_commit_skips_cleanup_and_retries_next_run() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        reconcile(&mut store, &feed_with(&["A", "C"]), media.path()).unwrap();
        let plot = storm_plot_path(&StormId::from("C"), ArtifactKind::ObservedTrack, feed_time());

        store.fail("retire_storm");
        let report = reconcile(&mut store, &feed_with(&["A"]), media.path()).unwrap();
        assert_eq!(report.retire_failed, vec![StormId::from("C")]);
        assert!(store.storm("C").realtime);
        assert!(media.path().join(&plot).exists());

        store.heal("retire_storm");
        let report = reconcile(&mut store, &feed_with(&["A"]), media.path()).unwrap();
        assert_eq!(report.retired, vec![StormId::from("C")]);
        assert!(!media.path().join(&plot).exists());
    }

    #[test]
    fn unreadable_realtime_set_skips_the_run() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let mut stale = Storm::blank(&StormId::from("C"), feed_time());
        stale.basin = Some("west_pacific".to_string());
        store.insert_storm(&stale).unwrap();
        store.fail("realtime_storm_ids");

        let report = reconcile(&mut store, &feed_with(&["A"]), media.path()).unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(store.storms.len(), 1);
        assert!(fs::read_dir(media.path()).unwrap().next().is_none());
    }
}
