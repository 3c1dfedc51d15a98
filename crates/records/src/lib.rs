//! Persistence seam for milestone records and channel bindings.
//!
//! Backends implement these traits; the engine depends on them only through
//! the trait bounds, so tests and local development can run entirely against
//! the in-memory implementations.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod types;

pub use types::{ChannelBinding, ItemKey, Milestone, MilestoneRecord};

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// A store of [`MilestoneRecord`]s.
#[async_trait]
pub trait MilestoneRecords: Clone + Send + Sync + 'static {
    /// The error type returned by the backend.
    type Error: Debug + Error + Send + Sync;

    /// Persist a record.
    ///
    /// # Errors
    ///
    /// Returns the backend's error on write failure.
    async fn create(&self, record: MilestoneRecord) -> Result<MilestoneRecord, Self::Error>;

    /// All records for an item, oldest first by creation time.
    ///
    /// # Errors
    ///
    /// Returns the backend's error on read failure.
    async fn find_many(&self, item: &ItemKey) -> Result<Vec<MilestoneRecord>, Self::Error>;

    /// The most recently created record for an item, if any.
    ///
    /// # Errors
    ///
    /// Returns the backend's error on read failure.
    async fn find_latest(&self, item: &ItemKey) -> Result<Option<MilestoneRecord>, Self::Error>;
}

/// A store of [`ChannelBinding`]s.
#[async_trait]
pub trait ChannelBindings: Clone + Send + Sync + 'static {
    /// The error type returned by the backend.
    type Error: Debug + Error + Send + Sync;

    /// Persist a binding.
    ///
    /// # Errors
    ///
    /// Returns the backend's error on write failure.
    async fn create(&self, binding: ChannelBinding) -> Result<ChannelBinding, Self::Error>;

    /// Look up the binding for a serialized item key.
    ///
    /// # Errors
    ///
    /// Returns the backend's error on read failure.
    async fn find_by_item_key(&self, item_key: &str)
    -> Result<Option<ChannelBinding>, Self::Error>;

    /// Mark the binding for an item key inactive.
    ///
    /// # Errors
    ///
    /// Returns the backend's error on write failure.
    async fn deactivate(&self, item_key: &str) -> Result<(), Self::Error>;

    /// All active bindings.
    ///
    /// # Errors
    ///
    /// Returns the backend's error on read failure.
    async fn list_active(&self) -> Result<Vec<ChannelBinding>, Self::Error>;
}
