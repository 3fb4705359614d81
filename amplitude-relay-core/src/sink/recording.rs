//! In-memory sink that records every call
//!
//! Used by the relay's tests and by hosts that want to assert on analytics
//! traffic without a network.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::types::{Credential, Properties, TraitValue};

use super::{AnalyticsSink, PrivacyOptions, SinkFactory};

/// One call received by a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Event {
        name: String,
        properties: Option<Properties>,
        out_of_session: bool,
    },
    Identify {
        property: String,
        value: TraitValue,
    },
}

/// Sink that stores calls in memory.
#[derive(Debug)]
pub struct RecordingSink {
    api_key: String,
    options: PrivacyOptions,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingSink {
    pub fn new(credential: &Credential, options: PrivacyOptions) -> Self {
        Self {
            api_key: credential.expose().to_string(),
            options,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Key this sink was built with
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Options applied at construction
    pub fn options(&self) -> PrivacyOptions {
        self.options
    }

    /// Snapshot of every call so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecordedCall>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AnalyticsSink for RecordingSink {
    fn log_event(&self, name: &str, properties: Option<&Properties>, out_of_session: bool) {
        self.lock().push(RecordedCall::Event {
            name: name.to_string(),
            properties: properties.cloned(),
            out_of_session,
        });
    }

    fn identify(&self, property: &str, value: &TraitValue) {
        self.lock().push(RecordedCall::Identify {
            property: property.to_string(),
            value: value.clone(),
        });
    }
}

/// Factory handing out [`RecordingSink`]s and remembering each one.
#[derive(Debug, Default)]
pub struct RecordingSinkFactory {
    built: Mutex<Vec<Arc<RecordingSink>>>,
    fail: bool,
}

impl RecordingSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build fails with [`Error::Sink`].
    pub fn failing() -> Self {
        Self {
            built: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// All sinks built so far, oldest first
    pub fn sinks(&self) -> Vec<Arc<RecordingSink>> {
        self.lock().clone()
    }

    /// The most recently built sink
    pub fn latest(&self) -> Option<Arc<RecordingSink>> {
        self.lock().last().cloned()
    }

    /// Number of sinks built so far
    pub fn build_count(&self) -> usize {
        self.lock().len()
    }

    /// Every call received by any sink this factory built, in build order
    pub fn all_calls(&self) -> Vec<RecordedCall> {
        self.lock().iter().flat_map(|sink| sink.calls()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<RecordingSink>>> {
        self.built
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SinkFactory for RecordingSinkFactory {
    fn build(
        &self,
        credential: &Credential,
        options: &PrivacyOptions,
    ) -> Result<Arc<dyn AnalyticsSink>> {
        if self.fail {
            return Err(Error::Sink("sink construction disabled".to_string()));
        }
        let sink = Arc::new(RecordingSink::new(credential, *options));
        self.lock().push(Arc::clone(&sink));
        Ok(sink)
    }
}
