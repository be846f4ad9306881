use log::{debug, info, warn};
use std::fs;
use std::path::{Component, Path};

use crate::db::store::StormStore;
use crate::models::feed::StormId;
use crate::services::artifacts::storm_dir;
use crate::services::commit::commit_step;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub rows_deleted: usize,
    pub files_deleted: usize,
    pub failures: usize,
}

// Catalog paths are relative to the media root; refuse anything that could leave it.
fn is_contained(rel: &str) -> bool {
    let path = Path::new(rel);
    path.components().next().is_some() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Remove every cataloged artifact of a retired storm, then its whole directory.
///
/// Per-row failures are logged and skipped. The final directory sweep also
/// takes files that never made it into the catalog; its errors are ignored.
pub fn cleanup<S: StormStore + ?Sized>(store: &mut S, media_root: &Path, storm_id: &StormId) -> CleanupReport {
    let mut report = CleanupReport::default();

    let plots = match store.storm_plots(storm_id) {
        Ok(plots) => plots,
        Err(e) => {
            warn!("Retire: listing artifacts of {} failed: {}", storm_id, e);
            report.failures += 1;
            Vec::new()
        }
    };

    for plot in plots {
        let subject = format!("{} plot #{}", storm_id, plot.id);
        match commit_step(store, "delete artifact row", subject, |s| s.delete_storm_plot(plot.id)) {
            Some(()) => report.rows_deleted += 1,
            None => report.failures += 1,
        }

        if !is_contained(&plot.file_path) {
            warn!("Retire: refusing to delete {} outside the media root", plot.file_path);
            report.failures += 1;
            continue;
        }
        match fs::remove_file(media_root.join(&plot.file_path)) {
            Ok(()) => report.files_deleted += 1,
            Err(e) => {
                warn!("Retire: deleting {} failed: {}", plot.file_path, e);
                report.failures += 1;
            }
        }
    }

    let dir = media_root.join(storm_dir(storm_id));
    if let Err(e) = fs::remove_dir_all(&dir) {
        debug!("Retire: sweeping {} skipped: {}", dir.display(), e);
    }

    info!(
        "Retire: {} cleaned (rows={}, files={}, failures={})",
        storm_id, report.rows_deleted, report.files_deleted, report.failures
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::models::NewStormPlot;
    use crate::models::feed::ArtifactKind;
    use crate::services::artifacts::storm_plot_path;
    use crate::services::testkit::feed_time;

    fn seed(store: &mut MemoryStore, media: &Path, id: &StormId, kinds: &[ArtifactKind], write_files: bool) {
        for kind in kinds {
            let rel = storm_plot_path(id, *kind, feed_time());
            if write_files {
                let abs = media.join(&rel);
                fs::create_dir_all(abs.parent().unwrap()).unwrap();
                fs::write(abs, b"png").unwrap();
            }
            store
                .insert_storm_plot(&NewStormPlot::new(id, feed_time(), *kind, rel))
                .unwrap();
        }
    }

    #[test]
    fn removes_rows_files_and_directory() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let id = StormId::from("WP182024");
        seed(
            &mut store,
            media.path(),
            &id,
            &[ArtifactKind::ObservedTrack, ArtifactKind::ForecastGefsDensity],
            true,
        );
        // an orphan from a failed catalog commit
        let orphan = media.path().join(storm_plot_path(&id, ArtifactKind::LatestForecast, feed_time()));
        fs::write(&orphan, b"png").unwrap();

        let report = cleanup(&mut store, media.path(), &id);

        assert_eq!(report.rows_deleted, 2);
        assert_eq!(report.files_deleted, 2);
        assert!(store.plots.is_empty());
        assert!(!media.path().join("storm_plots/WP182024").exists());
    }

    #[test]
    fn missing_files_do_not_stop_the_pass() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let id = StormId::from("WP182024");
        seed(
            &mut store,
            media.path(),
            &id,
            &[ArtifactKind::ObservedTrack, ArtifactKind::ForecastModelTracks],
            false,
        );

        let report = cleanup(&mut store, media.path(), &id);

        assert_eq!(report.rows_deleted, 2);
        assert_eq!(report.files_deleted, 0);
        assert_eq!(report.failures, 2);
    }

    #[test]
    fn row_delete_failure_still_sweeps_directory() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let id = StormId::from("WP182024");
        seed(&mut store, media.path(), &id, &[ArtifactKind::ObservedTrack], true);
        store.fail("delete_storm_plot");

        let report = cleanup(&mut store, media.path(), &id);

        assert_eq!(report.rows_deleted, 0);
        assert_eq!(store.plots.len(), 1);
        assert!(!media.path().join("storm_plots/WP182024").exists());
    }

    #[test]
    fn retiring_one_storm_leaves_a_lookalike_id_alone() {
        let media = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let active = StormId::from("AL06_2024");
        let retired = StormId::from("AL06.2024");
        seed(&mut store, media.path(), &active, &ArtifactKind::ALL[..4], true);
        seed(&mut store, media.path(), &retired, &[ArtifactKind::ObservedTrack], true);

        let report = cleanup(&mut store, media.path(), &retired);

        assert_eq!(report.rows_deleted, 1);
        assert_eq!(store.plots.len(), 4);
        for plot in &store.plots {
            assert!(media.path().join(&plot.file_path).is_file(), "{} missing", plot.file_path);
        }
        assert!(media.path().join("storm_plots/AL06_2024").is_dir());
        assert!(!media.path().join("storm_plots/AL06%2E2024").exists());
    }

    #[test]
    fn escaping_paths_are_not_touched() {
        assert!(is_contained("storm_plots/AL012024/20240101/00/x.png"));
        assert!(is_contained("storm_plots/%2E%2E/20240101/00/x.png"));
        assert!(!is_contained("/etc/passwd"));
        assert!(!is_contained("storm_plots/../../secret"));
        assert!(!is_contained(""));
    }
}
