//! Artifact generator: renders per-storm map products and catalogs them.
//!
//! Layout under the media root (stable, browsed directly by clients):
//!
//! ```text
//! storm_plots/<storm_id>/<YYYYMMDD>/<HH>/<kind>_<YYYY_MM_DD-HH_MM_SS>.png
//! summary_plots/<YYYYMMDD>/<HH>/<basin>_<YYYY_MM_DD-HH_MM_SS>.png
//! ```
//!
//! `<storm_id>` and `<basin>` go through [`encode_component`].
//!
//! Paths depend only on (storm id, kind, as-of), so regenerating a product for
//! the same feed time overwrites the same file and the same catalog row.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::client::{FeedClient, RenderError};
use crate::db::models::{NewStormPlot, Storm};
use crate::db::store::StormStore;
use crate::models::feed::{ArtifactKind, RenderRequest, RenderTarget, StormId};
use crate::services::commit::commit_step;

pub const STORM_PLOTS_DIR: &str = "storm_plots";
pub const SUMMARY_PLOTS_DIR: &str = "summary_plots";
const TRACK_SUFFIX: &str = "track";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStrategy {
    /// One image written straight to the artifact path.
    Single,
    /// Several files rendered into a scratch directory; the one whose stem
    /// ends in `suffix` becomes the artifact.
    Bundle { suffix: &'static str },
    /// Registered but not produced yet: no render, no catalog row.
    Inert,
}

pub struct KindEntry {
    pub kind: ArtifactKind,
    pub strategy: RenderStrategy,
    pub applies: fn(&Storm) -> bool,
}

/// Products generated for every storm, in generation order.
pub static REGISTRY: [KindEntry; 5] = [
    KindEntry {
        kind: ArtifactKind::ObservedTrack,
        strategy: RenderStrategy::Single,
        applies: |_| true,
    },
    KindEntry {
        kind: ArtifactKind::LatestForecast,
        strategy: RenderStrategy::Bundle { suffix: TRACK_SUFFIX },
        applies: |storm| !storm.invest,
    },
    KindEntry {
        kind: ArtifactKind::ForecastModelTracks,
        strategy: RenderStrategy::Single,
        applies: |_| true,
    },
    KindEntry {
        kind: ArtifactKind::ForecastGefsDensity,
        strategy: RenderStrategy::Single,
        applies: |_| true,
    },
    // GEFS member tracks: the renderer has no stable product for this yet.
    KindEntry {
        kind: ArtifactKind::ForecastGefsTracks,
        strategy: RenderStrategy::Inert,
        applies: |_| true,
    },
];

pub fn entry_for(kind: ArtifactKind) -> Option<&'static KindEntry> {
    REGISTRY.iter().find(|entry| entry.kind == kind)
}

/// Outcome of one `generate` pass, by kind.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ArtifactReport {
    pub cataloged: Vec<ArtifactKind>,
    pub render_failed: Vec<ArtifactKind>,
    /// Rendered to disk but the catalog commit failed; the file stays.
    pub uncataloged: Vec<ArtifactKind>,
    pub skipped: Vec<ArtifactKind>,
}

/// `YYYY_MM_DD-HH_MM_SS`, the as-of stamp used in file names.
pub fn stamp(as_of: DateTime<Utc>) -> String {
    as_of.format("%Y_%m_%d-%H_%M_%S").to_string()
}

fn partition(as_of: DateTime<Utc>) -> String {
    format!("{}/{}", as_of.format("%Y%m%d"), as_of.format("%H"))
}

/// Encode a feed-supplied value as one path component. Bytes outside
/// `[A-Za-z0-9_-]` become `%XX` and the empty string becomes `%`, so distinct
/// values never share a directory or file name.
pub fn encode_component(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

/// Storm directory relative to the media root.
pub fn storm_dir(storm_id: &StormId) -> String {
    format!("{}/{}", STORM_PLOTS_DIR, encode_component(storm_id.as_str()))
}

/// Artifact path relative to the media root; this is what gets cataloged.
pub fn storm_plot_path(storm_id: &StormId, kind: ArtifactKind, as_of: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}_{}.png",
        storm_dir(storm_id),
        partition(as_of),
        kind.as_str(),
        stamp(as_of)
    )
}

pub fn summary_plot_path(basin: &str, as_of: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}_{}.png",
        SUMMARY_PLOTS_DIR,
        partition(as_of),
        encode_component(basin),
        stamp(as_of)
    )
}

/// Create the parent directory chain of `path`; existing directories are fine.
pub fn ensure_parent(path: &Path) -> Result<(), RenderError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn find_suffixed(dir: &Path, suffix: &str) -> Result<PathBuf, RenderError> {
    let mut matches = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let stem_matches = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.ends_with(suffix));
        if path.is_file() && stem_matches {
            matches.push(path);
        }
    }
    matches.sort();
    matches
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::MissingTrackFile(dir.display().to_string()))
}

/// Render one product for `storm_id` into `target` according to the kind's strategy.
///
/// Bundle renders go through a scratch directory next to `target` which is
/// removed when this returns, whatever the outcome.
pub fn render_kind<F: FeedClient + ?Sized>(
    feed: &F,
    kind: ArtifactKind,
    storm_id: &StormId,
    target: &Path,
) -> Result<(), RenderError> {
    let request = RenderRequest::storm(kind, storm_id);
    ensure_parent(target)?;
    let entry =
        entry_for(kind).ok_or_else(|| RenderError::Unsupported(format!("no registry entry for {}", kind)))?;
    match entry.strategy {
        RenderStrategy::Single => feed.render(&request, &RenderTarget::File(target.to_path_buf())),
        RenderStrategy::Bundle { suffix } => {
            let scratch_parent = target.parent().unwrap_or_else(|| Path::new("."));
            let scratch = tempfile::Builder::new()
                .prefix(&format!(".scratch-{}-", kind.as_str()))
                .tempdir_in(scratch_parent)?;
            feed.render(&request, &RenderTarget::Directory(scratch.path().to_path_buf()))?;
            let chosen = find_suffixed(scratch.path(), suffix)?;
            fs::rename(&chosen, target)?;
            scratch.close()?;
            Ok(())
        }
        RenderStrategy::Inert => Ok(()),
    }
}

/// Render and catalog every applicable product for `storm` as of `as_of`.
///
/// Each kind is independent: a render failure abandons that kind only and
/// writes no catalog row; a failed catalog commit leaves the rendered file on
/// disk for retirement cleanup to collect.
pub fn generate<S, F>(store: &mut S, feed: &F, media_root: &Path, storm: &Storm, as_of: DateTime<Utc>) -> ArtifactReport
where
    S: StormStore + ?Sized,
    F: FeedClient + ?Sized,
{
    let storm_id = storm.storm_id();
    let mut report = ArtifactReport::default();

    for entry in REGISTRY.iter() {
        if !(entry.applies)(storm) || entry.strategy == RenderStrategy::Inert {
            debug!("Artifacts: {} skipping {}", storm_id, entry.kind);
            report.skipped.push(entry.kind);
            continue;
        }

        let rel_path = storm_plot_path(&storm_id, entry.kind, as_of);
        if let Err(e) = render_kind(feed, entry.kind, &storm_id, &media_root.join(&rel_path)) {
            warn!("Artifacts: {} {} render failed: {}", storm_id, entry.kind, e);
            report.render_failed.push(entry.kind);
            continue;
        }

        let row = NewStormPlot::new(&storm_id, as_of, entry.kind, rel_path);
        let subject = format!("{} {}", storm_id, entry.kind);
        match commit_step(store, "catalog artifact", subject, |s| s.insert_storm_plot(&row)) {
            Some(()) => report.cataloged.push(entry.kind),
            None => report.uncataloged.push(entry.kind),
        }
    }

    info!(
        "Artifacts: {} cataloged={} render_failed={} uncataloged={} skipped={}",
        storm_id,
        report.cataloged.len(),
        report.render_failed.len(),
        report.uncataloged.len(),
        report.skipped.len()
    );
    report
}
