//! The durable store of feeds and entries.

mod entries;
mod feeds;
mod schema;
mod types;

pub use schema::Database;
pub use types::{Entry, Feed, NewEntry, RepositoryError, SortBy};
