//! Scripted feed used by the engine tests.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use crate::client::{FeedClient, FeedError, RenderError};
use crate::models::feed::*;

pub fn feed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 10, 12, 0, 0).unwrap()
}

pub fn storm_snapshot(name: &str, basin: &str, invest: bool) -> StormSnapshot {
    serde_json::from_value(json!({
        "attributes": {
            "name": name,
            "year": 2024,
            "season": 2024,
            "basin": basin,
            "source": "hurdat",
            "unexpected": {"nested": true}
        },
        "track": {
            "date": ["2024-09-09T00:00:00", "2024-09-09T06:00:00"],
            "type": ["TD", "TS"],
            "lat": [20.5, 21.25],
            "lon": [-90.0, -91.5],
            "vmax": [30, 40],
            "mslp": [1006, null],
            "wmo_basin": [basin, basin]
        },
        "invest": invest
    }))
    .unwrap()
}

pub fn forecast_snapshot() -> ForecastSnapshot {
    serde_json::from_value(json!({
        "init": "2024-09-10T06:00:00Z",
        "series": {
            "fhr": [0, 12, 24],
            "lat": [21.25, 22.0, 23.1],
            "lon": [-91.5, -92.0, -92.7],
            "vmax": [40, 50, 65],
            "mslp": [1000, 995, 985],
            "type": ["TS", "TS", "HU"],
            "windrad": [{}, {}, {}],
            "cumulative_ace": [0.1, 0.3],
            "cumulative_ace_fhr": [12, 24]
        }
    }))
    .unwrap()
}

#[derive(Default)]
pub struct FakeFeed {
    pub time: Option<DateTime<Utc>>,
    pub active: BTreeSet<StormId>,
    pub snapshots: BTreeMap<StormId, StormSnapshot>,
    pub forecasts: BTreeMap<StormId, ForecastSnapshot>,
    /// Storms whose snapshot comes back unparseable.
    pub malformed: BTreeSet<StormId>,
    pub unreachable: bool,
    /// Bundle renders produce no `*_track` file.
    pub bundle_without_track: bool,
    failing_products: BTreeSet<&'static str>,
    failing_domains: BTreeSet<String>,
    pub renders: RefCell<Vec<RenderRequest>>,
    pub snapshot_fetches: RefCell<Vec<StormId>>,
}

impl FakeFeed {
    pub fn new() -> Self {
        FakeFeed {
            time: Some(feed_time()),
            ..FakeFeed::default()
        }
    }

    /// Register an active storm with its snapshot and optional forecast.
    pub fn with_storm(mut self, id: &str, snapshot: StormSnapshot, forecast: Option<ForecastSnapshot>) -> Self {
        let id = StormId::from(id);
        self.active.insert(id.clone());
        self.snapshots.insert(id.clone(), snapshot);
        if let Some(f) = forecast {
            self.forecasts.insert(id, f);
        }
        self
    }

    pub fn fail_product(&mut self, product: &'static str) {
        self.failing_products.insert(product);
    }

    pub fn fail_domain(&mut self, domain: &str) {
        self.failing_domains.insert(domain.to_string());
    }

    pub fn rendered_products(&self) -> Vec<&'static str> {
        self.renders.borrow().iter().map(|r| r.product.name()).collect()
    }

    fn should_fail(&self, request: &RenderRequest) -> bool {
        self.failing_products.contains(request.product.name())
            || request
                .domain
                .as_ref()
                .is_some_and(|d| self.failing_domains.contains(d))
    }
}

impl FeedClient for FakeFeed {
    fn list_active_storms(&self) -> Result<BTreeSet<StormId>, FeedError> {
        if self.unreachable {
            return Err(FeedError::Transport("connection refused".to_string()));
        }
        Ok(self.active.clone())
    }

    fn get_snapshot(&self, id: &StormId) -> Result<StormSnapshot, FeedError> {
        self.snapshot_fetches.borrow_mut().push(id.clone());
        if self.malformed.contains(id) {
            return Err(FeedError::Malformed(format!("/storms/{} at `track`: invalid type", id)));
        }
        self.snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| FeedError::NotAvailable(id.clone()))
    }

    fn get_forecast_snapshot(&self, id: &StormId) -> Result<Option<ForecastSnapshot>, FeedError> {
        Ok(self.forecasts.get(id).cloned())
    }

    fn render(&self, request: &RenderRequest, target: &RenderTarget) -> Result<(), RenderError> {
        self.renders.borrow_mut().push(request.clone());
        let label = format!("{} {:?} {:?}", request.product.name(), request.storm_id, request.domain);
        match target {
            RenderTarget::File(path) => {
                if self.should_fail(request) {
                    return Err(RenderError::Transport(format!("injected failure for {}", label)));
                }
                fs::write(path, label.as_bytes())?;
            }
            RenderTarget::Directory(dir) => {
                let stem = request.storm_id.as_ref().map(|s| s.0.clone()).unwrap_or_default();
                fs::write(dir.join(format!("{}_cone.png", stem)), b"cone")?;
                if self.should_fail(request) {
                    return Err(RenderError::Transport(format!("injected failure for {}", label)));
                }
                if !self.bundle_without_track {
                    fs::write(dir.join(format!("{}_track.png", stem)), label.as_bytes())?;
                }
            }
        }
        Ok(())
    }

    fn current_snapshot_time(&self) -> Result<DateTime<Utc>, FeedError> {
        if self.unreachable {
            return Err(FeedError::Transport("connection refused".to_string()));
        }
        self.time
            .ok_or_else(|| FeedError::Malformed("realtime index has no time".to_string()))
    }
}
