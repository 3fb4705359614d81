//! Analytics sinks
//!
//! A sink is a live vendor client bound to one API key. The relay never
//! builds one directly; it asks a [`SinkFactory`], handing over the fixed
//! [`PrivacyOptions`] so that every sink is privacy-restricted before it
//! can see a single event.
//!
//! Sinks must hand events off without blocking the caller. Delivery to the
//! backend is fire-and-forget: no buffering beyond the hand-off, no retry.

mod amplitude;
mod recording;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Credential, Properties, TraitValue};

pub use amplitude::{
    persistent_device_id, AmplitudeSink, AmplitudeSinkFactory, DeviceContext, EventPayload,
};
pub use recording::{RecordedCall, RecordingSink, RecordingSinkFactory};

/// A live analytics client.
pub trait AnalyticsSink: Send + Sync {
    /// Hand an event to the client.
    fn log_event(&self, name: &str, properties: Option<&Properties>, out_of_session: bool);

    /// Set a single user property on the current identity.
    fn identify(&self, property: &str, value: &TraitValue);

    /// Wait up to `timeout` for handed-off work to leave the process.
    ///
    /// Returns true when nothing is left pending.
    fn flush(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Builds sinks from credentials.
pub trait SinkFactory: Send + Sync {
    /// Build a sink for `credential` with `options` already applied.
    fn build(
        &self,
        credential: &Credential,
        options: &PrivacyOptions,
    ) -> Result<Arc<dyn AnalyticsSink>>;
}

/// Data collection switches applied to every sink at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivacyOptions {
    pub disable_advertising_id: bool,
    pub disable_coarse_location: bool,
    pub disable_city: bool,
    pub disable_carrier: bool,
    pub disable_lat_lng: bool,
}

impl PrivacyOptions {
    /// The option set the relay always uses: nothing identifying beyond
    /// the device id leaves the device.
    pub const fn restricted() -> Self {
        Self {
            disable_advertising_id: true,
            disable_coarse_location: true,
            disable_city: true,
            disable_carrier: true,
            disable_lat_lng: true,
        }
    }

    /// Collect everything the device context offers.
    pub const fn permissive() -> Self {
        Self {
            disable_advertising_id: false,
            disable_coarse_location: false,
            disable_city: false,
            disable_carrier: false,
            disable_lat_lng: false,
        }
    }
}

impl Default for PrivacyOptions {
    fn default() -> Self {
        Self::restricted()
    }
}
