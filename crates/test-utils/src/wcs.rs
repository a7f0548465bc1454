//! Fake WCS endpoint for fetcher and end-to-end tests.
//!
//! Answers `GetCoverage` requests on `127.0.0.1:<ephemeral>` with a
//! [`fake_raster`](crate::fake_raster) payload. Individual slices can be
//! made to fail with an HTTP status or to carry a different band count.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::fixtures::{fake_raster, GRASSLAND_BANDS};

/// Path the fake service is mounted at.
pub const WCS_PATH: &str = "/flf/ows";

#[derive(Default)]
struct Behaviour {
    default_bands: usize,
    bands: HashMap<i32, usize>,
    failures: HashMap<i32, u16>,
    requests: Vec<i32>,
}

#[derive(Clone, Default)]
struct WcsState(Arc<Mutex<Behaviour>>);

impl WcsState {
    fn lock(&self) -> MutexGuard<'_, Behaviour> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Running fake coverage service. Stops when dropped.
pub struct FakeWcs {
    addr: SocketAddr,
    state: WcsState,
    task: JoinHandle<()>,
}

impl FakeWcs {
    /// Serve six-band slices for every year.
    pub async fn start() -> Self {
        Self::with_bands(GRASSLAND_BANDS).await
    }

    pub async fn with_bands(bands: usize) -> Self {
        let state = WcsState::default();
        state.lock().default_bands = bands;

        let app = Router::new()
            .route(WCS_PATH, get(get_coverage))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake WCS listener");
        let addr = listener.local_addr().expect("Listener has no local address");

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state, task }
    }

    /// Base URL to put into `coverage.base_url`.
    pub fn base_url(&self) -> String {
        format!("http://{}{}", self.addr, WCS_PATH)
    }

    /// Answer requests for `year` with `status` and an exception body.
    pub fn fail_slice(&self, year: i32, status: u16) {
        self.state.lock().failures.insert(year, status);
    }

    /// Serve `bands` bands for `year` instead of the default.
    pub fn set_bands(&self, year: i32, bands: usize) {
        self.state.lock().bands.insert(year, bands);
    }

    /// Years requested so far, in arrival order.
    pub fn requests(&self) -> Vec<i32> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }
}

impl Drop for FakeWcs {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn get_coverage(
    State(state): State<WcsState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("REQUEST").map(String::as_str) != Some("GetCoverage") {
        return (StatusCode::BAD_REQUEST, "unsupported request").into_response();
    }
    if !params.contains_key("COVERAGEID") {
        return (StatusCode::BAD_REQUEST, "missing COVERAGEID").into_response();
    }
    let Some(year) = params.get("SUBSET").and_then(|s| subset_year(s)) else {
        return (StatusCode::BAD_REQUEST, "missing or malformed SUBSET").into_response();
    };

    let mut behaviour = state.lock();
    behaviour.requests.push(year);

    if let Some(&status) = behaviour.failures.get(&year) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "<ows:ExceptionReport/>").into_response();
    }

    let bands = behaviour
        .bands
        .get(&year)
        .copied()
        .unwrap_or(behaviour.default_bands);
    ([(header::CONTENT_TYPE, "image/tiff")], fake_raster(bands)).into_response()
}

/// Year from `ansi("2020-01-01T00:00:00.000Z")`.
fn subset_year(subset: &str) -> Option<i32> {
    let instant = subset.strip_prefix("ansi(\"")?;
    instant.get(..4)?.parse().ok()
}
