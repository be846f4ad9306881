//! Storm feed client.
//!
//! - `FeedClient` is the capability the engine consumes: active-storm index,
//!   per-storm snapshots, forecasts and rendering.
//! - `HttpFeedClient` talks to the feed service over HTTP using blocking `ureq`.
//!
//! One client instance is used per run. The realtime index is cached on first
//! use so that `list_active_storms` and `current_snapshot_time` describe the
//! same feed state.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::Rng;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::num::NonZeroU32;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::models::feed::*;

// Rendered images can be large; ureq's default body limit is 10 MiB.
const MAX_IMAGE_BYTES: u64 = 64 * 1024 * 1024;
const BACKOFF_BASE_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug)]
pub enum FeedError {
    /// The feed does not know this storm (any more).
    NotAvailable(StormId),
    Transport(String),
    Http { status: u16, message: String },
    /// The payload did not have the documented shape.
    Malformed(String),
}

impl FeedError {
    /// Everything but a per-storm miss makes the feed unusable for the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FeedError::NotAvailable(_))
    }
}

impl core::fmt::Display for FeedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FeedError::NotAvailable(id) => write!(f, "storm {} not available from feed", id),
            FeedError::Transport(s) => write!(f, "transport error: {}", s),
            FeedError::Http { status, message } => write!(f, "http {}: {}", status, message),
            FeedError::Malformed(s) => write!(f, "malformed feed payload: {}", s),
        }
    }
}

impl std::error::Error for FeedError {}

#[derive(Debug)]
pub enum RenderError {
    Transport(String),
    Http { status: u16, message: String },
    Io(io::Error),
    /// A multi-file render produced no file with the expected suffix.
    MissingTrackFile(String),
    /// The renderer returned something other than what the target asked for.
    Unsupported(String),
}

impl core::fmt::Display for RenderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RenderError::Transport(s) => write!(f, "render transport error: {}", s),
            RenderError::Http { status, message } => write!(f, "render http {}: {}", status, message),
            RenderError::Io(e) => write!(f, "render io error: {}", e),
            RenderError::MissingTrackFile(dir) => write!(f, "no track file produced in {}", dir),
            RenderError::Unsupported(s) => write!(f, "unsupported render output: {}", s),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RenderError {
    fn from(value: io::Error) -> Self {
        RenderError::Io(value)
    }
}

/// What the reconciliation engine needs from the outside world.
pub trait FeedClient {
    fn list_active_storms(&self) -> Result<BTreeSet<StormId>, FeedError>;
    fn get_snapshot(&self, id: &StormId) -> Result<StormSnapshot, FeedError>;
    /// `Ok(None)` when the storm has no forecast yet; that is not an error.
    fn get_forecast_snapshot(&self, id: &StormId) -> Result<Option<ForecastSnapshot>, FeedError>;
    /// Synchronously render `request` into `target`.
    fn render(&self, request: &RenderRequest, target: &RenderTarget) -> Result<(), RenderError>;
    fn current_snapshot_time(&self) -> Result<DateTime<Utc>, FeedError>;
}

#[derive(Debug, Deserialize)]
struct RenderManifest {
    files: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    url: String,
}

enum Fetch {
    Ok(ureq::http::Response<ureq::Body>),
    Missing,
}

pub struct HttpFeedClient {
    agent: ureq::Agent,
    base_url: String,
    jtwc_source: String,
    max_retries: NonZeroU32,
    index: RefCell<Option<RealtimeIndex>>,
}

impl HttpFeedClient {
    pub fn new(
        base_url: impl Into<String>,
        jtwc_source: impl Into<String>,
        timeout: Duration,
        max_retries: NonZeroU32,
    ) -> Self {
        let config = ureq::Agent::config_builder().timeout_global(Some(timeout)).build();
        HttpFeedClient {
            agent: config.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            jtwc_source: jtwc_source.into(),
            max_retries,
            index: RefCell::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Run `call`, retrying transport failures with jittered exponential backoff.
    /// HTTP status errors are returned immediately.
    fn with_retries<T>(
        &self,
        what: &str,
        mut call: impl FnMut() -> Result<T, ureq::Error>,
    ) -> Result<T, ureq::Error> {
        let mut attempt: u32 = 0;
        loop {
            match call() {
                Err(e) if !matches!(e, ureq::Error::StatusCode(_)) && attempt < self.max_retries.get() => {
                    attempt += 1;
                    let backoff = backoff_ms(attempt);
                    let jitter = rand::rng().random_range(0..=backoff / 2);
                    warn!(
                        "Feed: {} failed ({}); retry {}/{} in {}ms",
                        what,
                        e,
                        attempt,
                        self.max_retries.get(),
                        backoff + jitter
                    );
                    thread::sleep(Duration::from_millis(backoff + jitter));
                }
                other => return other,
            }
        }
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Fetch, FeedError> {
        let url = self.url(path);
        let result = self.with_retries(path, || {
            let mut req = self.agent.get(&url).header("Accept", "application/json");
            for (k, v) in query {
                req = req.query(*k, *v);
            }
            req.call()
        });
        match result {
            Ok(resp) if resp.status() == http::StatusCode::NO_CONTENT => Ok(Fetch::Missing),
            Ok(resp) => Ok(Fetch::Ok(resp)),
            Err(ureq::Error::StatusCode(404)) => Ok(Fetch::Missing),
            Err(ureq::Error::StatusCode(status)) => Err(FeedError::Http {
                status,
                message: format!("GET {}", url),
            }),
            Err(e) => Err(FeedError::Transport(e.to_string())),
        }
    }

    fn decode<T: DeserializeOwned>(path: &str, mut resp: ureq::http::Response<ureq::Body>) -> Result<T, FeedError> {
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| FeedError::Transport(e.to_string()))?;
        parse_json(path, &body)
    }

    fn realtime_index(&self) -> Result<RealtimeIndex, FeedError> {
        if let Some(index) = self.index.borrow().as_ref() {
            return Ok(index.clone());
        }
        let index: RealtimeIndex = match self.get("/realtime", &[("jtwc_source", self.jtwc_source.as_str())])? {
            Fetch::Ok(resp) => Self::decode("/realtime", resp)?,
            Fetch::Missing => return Err(FeedError::Malformed("/realtime returned no content".to_string())),
        };
        debug!("Feed: realtime index at {} lists {} storm(s)", index.time, index.storms.len());
        *self.index.borrow_mut() = Some(index.clone());
        Ok(index)
    }

    /// Forget the cached realtime index so the next call sees fresh feed state.
    pub fn refresh(&self) {
        self.index.borrow_mut().take();
    }

    fn download(&self, url: &str, target: &Path) -> Result<(), RenderError> {
        let result = self.with_retries(url, || self.agent.get(url).call());
        let mut resp = result.map_err(render_error)?;
        let bytes = resp
            .body_mut()
            .with_config()
            .limit(MAX_IMAGE_BYTES)
            .read_to_vec()
            .map_err(render_error)?;
        fs::write(target, bytes)?;
        Ok(())
    }
}

/// Delay before retry `attempt` (1-based): doubles from the base, capped.
fn backoff_ms(attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| BACKOFF_BASE_MS.checked_mul(factor))
        .map_or(MAX_BACKOFF_MS, |delay| delay.min(MAX_BACKOFF_MS))
}

/// Decode a feed payload; failures name the offending field path.
fn parse_json<T: DeserializeOwned>(path: &str, body: &str) -> Result<T, FeedError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de)
        .map_err(|e| FeedError::Malformed(format!("{} at `{}`: {}", path, e.path(), e.inner())))
}

fn render_error(e: ureq::Error) -> RenderError {
    match e {
        ureq::Error::StatusCode(status) => RenderError::Http {
            status,
            message: "renderer rejected request".to_string(),
        },
        other => RenderError::Transport(other.to_string()),
    }
}

impl FeedClient for HttpFeedClient {
    fn list_active_storms(&self) -> Result<BTreeSet<StormId>, FeedError> {
        Ok(self.realtime_index()?.storms.into_iter().collect())
    }

    fn get_snapshot(&self, id: &StormId) -> Result<StormSnapshot, FeedError> {
        let path = format!("/storms/{}", id);
        match self.get(&path, &[("jtwc_source", self.jtwc_source.as_str())])? {
            Fetch::Ok(resp) => Self::decode(&path, resp),
            Fetch::Missing => Err(FeedError::NotAvailable(id.clone())),
        }
    }

    fn get_forecast_snapshot(&self, id: &StormId) -> Result<Option<ForecastSnapshot>, FeedError> {
        let path = format!("/storms/{}/forecast", id);
        match self.get(&path, &[])? {
            Fetch::Ok(resp) => Self::decode::<Option<ForecastSnapshot>>(&path, resp),
            Fetch::Missing => Ok(None),
        }
    }

    fn render(&self, request: &RenderRequest, target: &RenderTarget) -> Result<(), RenderError> {
        let mode = match target {
            RenderTarget::File(_) => "single",
            RenderTarget::Directory(_) => "bundle",
        };
        let body = serde_json::json!({
            "product": request.product.name(),
            "storm_id": request.storm_id,
            "domain": request.domain,
            "mode": mode,
            "jtwc_source": self.jtwc_source,
        });
        let url = self.url("/render");
        let mut resp = self
            .with_retries("/render", || self.agent.post(&url).send_json(&body))
            .map_err(render_error)?;

        match target {
            RenderTarget::File(path) => {
                let bytes = resp
                    .body_mut()
                    .with_config()
                    .limit(MAX_IMAGE_BYTES)
                    .read_to_vec()
                    .map_err(render_error)?;
                if bytes.is_empty() {
                    return Err(RenderError::Unsupported("empty image body".to_string()));
                }
                fs::write(path, bytes)?;
            }
            RenderTarget::Directory(dir) => {
                let text = resp.body_mut().read_to_string().map_err(render_error)?;
                let manifest: RenderManifest = serde_json::from_str(&text)
                    .map_err(|e| RenderError::Unsupported(format!("bundle manifest: {}", e)))?;
                for entry in manifest.files {
                    // Only the final component is trusted; the renderer never picks our directories.
                    let name = Path::new(&entry.name)
                        .file_name()
                        .ok_or_else(|| RenderError::Unsupported(format!("bad file name `{}`", entry.name)))?;
                    self.download(&entry.url, &dir.join(name))?;
                }
            }
        }
        Ok(())
    }

    fn current_snapshot_time(&self) -> Result<DateTime<Utc>, FeedError> {
        Ok(self.realtime_index()?.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Storm;
    use crate::mapping::apply_storm_snapshot;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// A scripted reply for one accepted connection; `None` hangs up without answering.
    type Reply = Option<String>;

    fn reply(status: &str, body: &str) -> Reply {
        Some(format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        ))
    }

    fn local_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    /// Answer one connection per reply, in order; yields the request lines seen.
    fn serve(listener: TcpListener, replies: Vec<Reply>) -> JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let mut seen = Vec::new();
            for scripted in replies {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut content_length = 0;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header.trim().is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap();
                        }
                    }
                }
                let mut body = vec![0; content_length];
                reader.read_exact(&mut body).unwrap();
                seen.push(request_line.trim().to_string());
                if let Some(response) = scripted {
                    reader.get_mut().write_all(response.as_bytes()).unwrap();
                }
            }
            seen
        })
    }

    fn client(base: &str, retries: u32) -> HttpFeedClient {
        HttpFeedClient::new(base, "jtwc", Duration::from_secs(5), NonZeroU32::new(retries).unwrap())
    }

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/data/{}", name)).expect("fixture present")
    }

    #[test]
    fn decodes_realtime_index() {
        let index: RealtimeIndex = parse_json("/realtime", &fixture("realtime-index.json")).unwrap();
        assert_eq!(index.time.to_rfc3339(), "2024-09-10T12:00:00+00:00");
        assert_eq!(index.storms.len(), 4);
        assert_eq!(index.storms[0], StormId::from("AL062024"));
    }

    #[test]
    fn snapshot_fixture_maps_onto_a_storm() {
        let snapshot: StormSnapshot = parse_json("/storms/AL062024", &fixture("storm-snapshot.json")).unwrap();
        let id = StormId::from("AL062024");
        let as_of = chrono::DateTime::parse_from_rfc3339("2024-09-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut storm = Storm::blank(&id, as_of);

        let report = apply_storm_snapshot(&mut storm, &snapshot, as_of).unwrap();

        assert_eq!(storm.name.as_deref(), Some("FRANCINE"));
        assert_eq!(storm.track_lengths(), [4; 7]);
        assert_eq!(storm.mslp[2], None);
        assert!(report.rejected.contains(&"id".to_string()));
        assert!(report.rejected.contains(&"realtime".to_string()));
        assert!(report.rejected.contains(&"extra_obs".to_string()));
    }

    #[test]
    fn malformed_payload_names_the_field() {
        let err = parse_json::<StormSnapshot>("/storms/AL062024", &fixture("storm-snapshot-bad-track.json"))
            .unwrap_err();
        match err {
            FeedError::Malformed(msg) => assert!(msg.contains("track.date"), "{}", msg),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn only_missing_storms_are_recoverable() {
        assert!(!FeedError::NotAvailable(StormId::from("AL012024")).is_fatal());
        assert!(FeedError::Transport("reset".to_string()).is_fatal());
        assert!(FeedError::Http { status: 502, message: "GET".to_string() }.is_fatal());
        assert!(FeedError::Malformed("x".to_string()).is_fatal());
    }

    #[test]
    fn joins_paths_onto_base_url() {
        let client = HttpFeedClient::new(
            "http://feed:8000/api/",
            "jtwc",
            Duration::from_secs(5),
            NonZeroU32::MIN,
        );
        assert_eq!(client.url("/realtime"), "http://feed:8000/api/realtime");
        assert_eq!(client.url("storms/AL062024"), "http://feed:8000/api/storms/AL062024");
    }

    #[test]
    fn status_errors_become_http_render_errors() {
        assert!(matches!(
            render_error(ureq::Error::StatusCode(503)),
            RenderError::Http { status: 503, .. }
        ));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_ms(1), BACKOFF_BASE_MS);
        assert_eq!(backoff_ms(2), 2 * BACKOFF_BASE_MS);
        assert_eq!(backoff_ms(4), 8 * BACKOFF_BASE_MS);
        assert_eq!(backoff_ms(20), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(64), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(u32::MAX), MAX_BACKOFF_MS);
    }

    #[test]
    fn missing_storm_is_not_available() {
        let (listener, base) = local_listener();
        let server = serve(listener, vec![reply("404 Not Found", "")]);

        let err = client(&base, 1).get_snapshot(&StormId::from("AL012024")).unwrap_err();

        assert!(matches!(err, FeedError::NotAvailable(ref id) if id.as_str() == "AL012024"), "{:?}", err);
        assert_eq!(server.join().unwrap(), vec!["GET /storms/AL012024?jtwc_source=jtwc HTTP/1.1"]);
    }

    #[test]
    fn absent_forecast_in_any_form_is_none() {
        let (listener, base) = local_listener();
        let server = serve(
            listener,
            vec![reply("204 No Content", ""), reply("404 Not Found", ""), reply("200 OK", "null")],
        );
        let feed = client(&base, 1);
        let id = StormId::from("AL062024");

        for _ in 0..3 {
            assert!(feed.get_forecast_snapshot(&id).unwrap().is_none());
        }
        assert_eq!(server.join().unwrap().len(), 3);
    }

    #[test]
    fn server_errors_are_returned_without_retrying() {
        let (listener, base) = local_listener();
        let server = serve(listener, vec![reply("500 Internal Server Error", "")]);

        let err = client(&base, 3).get_snapshot(&StormId::from("AL062024")).unwrap_err();

        assert!(matches!(err, FeedError::Http { status: 500, .. }), "{:?}", err);
        assert!(err.is_fatal());
        assert_eq!(server.join().unwrap().len(), 1);
    }

    #[test]
    fn dropped_connection_is_retried() {
        let (listener, base) = local_listener();
        let server = serve(listener, vec![None, reply("200 OK", &fixture("realtime-index.json"))]);
        let feed = client(&base, 2);

        let storms = feed.list_active_storms().unwrap();

        assert_eq!(storms.len(), 4);
        let seen = server.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|line| line.starts_with("GET /realtime?jtwc_source=jtwc ")));
        // served from the cached index
        assert_eq!(feed.current_snapshot_time().unwrap().to_rfc3339(), "2024-09-10T12:00:00+00:00");
    }

    #[test]
    fn bundle_files_land_in_target_dir_by_base_name() {
        let (listener, base) = local_listener();
        let manifest = format!(
            r#"{{"files": [{{"name": "../../AL062024_track.png", "url": "{}/files/1"}}]}}"#,
            base
        );
        let server = serve(listener, vec![reply("200 OK", &manifest), reply("200 OK", "PNG")]);
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        fs::create_dir(&bundle).unwrap();
        let request = RenderRequest::storm(ArtifactKind::LatestForecast, &StormId::from("AL062024"));

        client(&base, 1)
            .render(&request, &RenderTarget::Directory(bundle.clone()))
            .unwrap();

        assert_eq!(fs::read_to_string(bundle.join("AL062024_track.png")).unwrap(), "PNG");
        assert_eq!(fs::read_dir(&bundle).unwrap().count(), 1);
        assert!(!dir.path().join("AL062024_track.png").exists());
        let seen = server.join().unwrap();
        assert_eq!(seen, vec!["POST /render HTTP/1.1", "GET /files/1 HTTP/1.1"]);
    }

    #[test]
    fn bundle_entry_without_file_name_is_refused() {
        let (listener, base) = local_listener();
        let manifest = format!(r#"{{"files": [{{"name": "..", "url": "{}/files/1"}}]}}"#, base);
        let server = serve(listener, vec![reply("200 OK", &manifest)]);
        let dir = tempfile::tempdir().unwrap();
        let request = RenderRequest::storm(ArtifactKind::LatestForecast, &StormId::from("AL062024"));

        let err = client(&base, 1)
            .render(&request, &RenderTarget::Directory(dir.path().to_path_buf()))
            .unwrap_err();

        assert!(matches!(err, RenderError::Unsupported(_)), "{:?}", err);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(server.join().unwrap().len(), 1);
    }
}
