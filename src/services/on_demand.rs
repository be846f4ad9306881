use log::info;
use std::fs;

use crate::client::{FeedClient, RenderError};
use crate::db::store::StormStore;
use crate::errors::EngineError;
use crate::models::feed::{ArtifactKind, StormId};
use crate::services::artifacts::render_kind;

/// Render a fresh image for one storm without cataloging it.
///
/// `want_forecast` selects the latest forecast product instead of the
/// observed track; invest storms have no forecast and answer `NoForecast`.
pub fn render_on_demand<S, F>(
    store: &mut S,
    feed: &F,
    storm_id: &StormId,
    want_forecast: bool,
) -> Result<Vec<u8>, EngineError>
where
    S: StormStore + ?Sized,
    F: FeedClient + ?Sized,
{
    let storm = store
        .find_storm(storm_id)?
        .ok_or_else(|| EngineError::NotFound(storm_id.clone()))?;

    let kind = if want_forecast {
        if storm.invest {
            return Err(EngineError::NoForecast(storm_id.clone()));
        }
        ArtifactKind::LatestForecast
    } else {
        ArtifactKind::ObservedTrack
    };

    let workdir = tempfile::tempdir().map_err(RenderError::from)?;
    let target = workdir.path().join(format!("{}.png", kind.as_str()));
    render_kind(feed, kind, storm_id, &target)?;
    let bytes = fs::read(&target).map_err(RenderError::from)?;

    info!("On-demand: rendered {} for {} ({} bytes)", kind, storm_id, bytes.len());
    Ok(bytes)
}
