//! Basin summary job: one parent record per run, one child per rendered basin.

use log::{error, info, warn};
use std::collections::BTreeSet;
use std::path::Path;

use crate::client::FeedClient;
use crate::db::models::{NewSummaryPlotFile, SummaryPlot};
use crate::db::store::StormStore;
use crate::errors::EngineError;
use crate::models::feed::{RenderRequest, RenderTarget};
use crate::services::artifacts::{ensure_parent, stamp, summary_plot_path};
use crate::services::commit::commit_step;

/// Synthetic basin covering every active storm.
pub const ALL_BASINS: &str = "all";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SummaryReport {
    /// Parent record id; `None` when the job was skipped.
    pub plot_id: Option<String>,
    pub written: Vec<String>,
    pub failed: Vec<String>,
}

pub fn build_summary<S, F>(store: &mut S, feed: &F, media_root: &Path) -> Result<SummaryReport, EngineError>
where
    S: StormStore + ?Sized,
    F: FeedClient + ?Sized,
{
    let mut report = SummaryReport::default();
    let as_of = feed.current_snapshot_time().map_err(|e| {
        error!("Summary: aborting run, feed unusable: {}", e);
        EngineError::FatalFeed(e)
    })?;

    let mut basins: BTreeSet<String> = match store.realtime_basins() {
        Ok(basins) => basins,
        Err(e) => {
            error!("Summary: reading active basins failed, skipping run: {}", e);
            return Ok(report);
        }
    };
    basins.insert(ALL_BASINS.to_string());

    let parent = SummaryPlot {
        id: stamp(as_of),
        created_on: as_of,
    };
    if commit_step(store, "create summary", &parent.id, |s| s.insert_summary_plot(&parent)).is_none() {
        warn!("Summary: no parent record for {}, skipping run", parent.id);
        return Ok(report);
    }
    report.plot_id = Some(parent.id.clone());

    for basin in &basins {
        let rel_path = summary_plot_path(basin, as_of);
        let target = media_root.join(&rel_path);
        let rendered = ensure_parent(&target).and_then(|()| {
            feed.render(&RenderRequest::basin_summary(basin), &RenderTarget::File(target.clone()))
        });
        if let Err(e) = rendered {
            warn!("Summary: {} render failed: {}", basin, e);
            report.failed.push(basin.clone());
            continue;
        }

        let child = NewSummaryPlotFile {
            plot_id: parent.id.clone(),
            basin: basin.clone(),
            file_path: rel_path,
        };
        let subject = format!("{} {}", parent.id, basin);
        match commit_step(store, "catalog summary", subject, |s| s.insert_summary_plot_file(&child)) {
            Some(()) => report.written.push(basin.clone()),
            None => report.failed.push(basin.clone()),
        }
    }

    info!(
        "Summary: {} done (basins={}, written={}, failed={})",
        parent.id,
        basins.len(),
        report.written.len(),
        report.failed.len()
    );
    Ok(report)
}
