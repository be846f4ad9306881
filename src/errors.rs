use http::StatusCode;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::client::{FeedError, RenderError};
use crate::db::store::StoreError;
use crate::models::feed::StormId;

/// Errors surfaced by the engine's public operations.
///
/// Only `FatalFeed` ever escapes `reconcile` and `build_summary`; the
/// persistence and render variants are absorbed per step and reach callers
/// only through `render_on_demand`.
#[derive(Debug)]
pub enum EngineError {
    NotFound(StormId),
    /// A forecast product was requested for a storm that cannot have one.
    NoForecast(StormId),
    TransientPersistence(StoreError),
    Render(RenderError),
    FatalFeed(FeedError),
}

impl EngineError {
    /// Status the query API answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::NoForecast(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "storm with id {} does not exist", id),
            EngineError::NoForecast(id) => write!(f, "storm {} has no forecast", id),
            EngineError::TransientPersistence(e) => write!(f, "persistence error: {}", e),
            EngineError::Render(e) => write!(f, "{}", e),
            EngineError::FatalFeed(e) => write!(f, "feed unusable: {}", e),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::TransientPersistence(e) => Some(e),
            EngineError::Render(e) => Some(e),
            EngineError::FatalFeed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        EngineError::TransientPersistence(value)
    }
}

impl From<RenderError> for EngineError {
    fn from(value: RenderError) -> Self {
        EngineError::Render(value)
    }
}

impl From<FeedError> for EngineError {
    fn from(value: FeedError) -> Self {
        EngineError::FatalFeed(value)
    }
}
