//! Persisted entities of the TCO store.
//!
//! # Reference data
//!
//! - [`Program`] groups [`Team`]s; each team carries its staffing FTEs and,
//!   separately, its annual [`TeamRate`]s.
//! - [`ApplicationGroup`]s are owned by a team; [`Application`]s belong to a
//!   group and are supplied by a [`Vendor`].
//!
//! # Spend
//!
//! - [`Invoice`]: a cost line per application, team and fiscal year. Recurring
//!   invoices are rolled over from one fiscal year to the next in batches
//!   recorded as [`RolloverLogEntry`].
//!
//! # ADO
//!
//! - Imported features are stored as [`tco_core::FeatureRecord`]s keyed by
//!   feature id; [`TeamMapping`] and [`AppMapping`] resolve their raw labels.

mod ado;
mod application;
mod invoice;
mod program;
mod team;
mod vendor;

pub use ado::*;
pub use application::*;
pub use invoice::*;
pub use program::*;
pub use team::*;
pub use vendor::*;

use serde::{Deserialize, Deserializer};

/// Deserialize a field that is present in the payload as `Some`.
///
/// Used on `Option<Option<T>>` update fields: a missing field keeps the
/// current value, an explicit `null` clears it.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}
