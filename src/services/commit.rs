use log::error;
use std::fmt::Display;

use crate::db::store::{StoreError, StormStore};

/// Run one entity mutation as its own transaction.
///
/// The store rolls the transaction back on failure; here the failure is
/// logged against `step` and `subject` and swallowed, so the caller only
/// decides whether its remaining sub-steps still make sense.
pub fn commit_step<S, T>(
    store: &mut S,
    step: &str,
    subject: impl Display,
    write: impl FnOnce(&mut S) -> Result<T, StoreError>,
) -> Option<T>
where
    S: StormStore + ?Sized,
{
    match write(store) {
        Ok(value) => Some(value),
        Err(e) => {
            error!("{}: commit failed for {}, rolled back: {}", step, subject, e);
            None
        }
    }
}
