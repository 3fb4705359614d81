//! The event relay
//!
//! [`EventRelay`] owns zero or one live sink. It reads the stored API key on
//! startup, rebuilds the sink whenever the key changes and forwards events
//! to it, or drops them while no key is configured.
//!
//! ## Concurrency
//!
//! Record calls take a read lock on the sink slot and hand the event off
//! while holding it, so a concurrent [`EventRelay::configure`] can't swap the
//! sink out from under them. `configure` builds the replacement sink before
//! taking the write lock; recorders observe either the old or the new sink,
//! never a partially built one. A separate mutex serializes writers so that
//! store writes and sink swaps happen in the same order.
//!
//! ## Failure handling
//!
//! Nothing here returns an error or panics. Store and sink failures are
//! logged and degrade to "analytics disabled".

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::credentials::{CredentialError, CredentialStore};
use crate::error::Error;
use crate::sink::{AnalyticsSink, PrivacyOptions, SinkFactory};
use crate::types::{
    AnalyticsEvent, ConfigurationState, Credential, IdentifyTrait, LifecycleEvent, LifecycleKind,
    Properties,
};

/// Service name the API key is stored under unless configured otherwise
pub const DEFAULT_CREDENTIAL_SERVICE: &str = "AmplitudeAPIKey";

/// Receives state-changed notifications after lifecycle events.
pub trait LifecycleListener: Send + Sync {
    fn lifecycle_changed(&self, kind: LifecycleKind, state: ConfigurationState);
}

/// The sink currently in use and the credential it was built from
struct ActiveSink {
    credential: Credential,
    sink: Arc<dyn AnalyticsSink>,
}

/// Forwards analytics events to a sink built from the stored API key.
pub struct EventRelay {
    store: Arc<dyn CredentialStore>,
    factory: Arc<dyn SinkFactory>,
    service: String,
    options: PrivacyOptions,
    active: RwLock<Option<ActiveSink>>,
    writer: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
}

impl EventRelay {
    /// Create a relay using the default service name.
    ///
    /// Reads the stored credential; an unreadable store leaves the relay
    /// unconfigured.
    pub fn new(store: Arc<dyn CredentialStore>, factory: Arc<dyn SinkFactory>) -> Self {
        Self::with_service(store, factory, DEFAULT_CREDENTIAL_SERVICE)
    }

    /// Create a relay storing its credential under `service`.
    pub fn with_service(
        store: Arc<dyn CredentialStore>,
        factory: Arc<dyn SinkFactory>,
        service: impl Into<String>,
    ) -> Self {
        let relay = Self {
            store,
            factory,
            service: service.into(),
            options: PrivacyOptions::restricted(),
            active: RwLock::new(None),
            writer: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        };

        let stored = match relay.store.get_credential(&relay.service) {
            Ok(value) => Credential::parse(Some(&value)),
            Err(CredentialError::NotFound(_)) => {
                tracing::info!(service = %relay.service, "No stored credential, analytics disabled");
                None
            }
            Err(e) => {
                let err = Error::CredentialUnavailable(e.to_string());
                tracing::warn!(service = %relay.service, error = %err, "Analytics disabled");
                None
            }
        };

        if let Some(credential) = stored {
            let active = relay.build_sink(credential);
            *relay.write_active() = active;
        }

        relay
    }

    /// Register a listener for lifecycle notifications.
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Store `credential` and rebuild the sink from it.
    ///
    /// `None` and empty input clear the credential and drop the sink. A
    /// store write failure is logged and the in-memory transition still
    /// happens. Configuring the key the live sink was built from keeps that
    /// sink.
    pub fn configure(&self, credential: Option<&str>) {
        self.apply_credential(credential);
    }

    /// Performs [`EventRelay::configure`] and returns the state it left,
    /// read while still holding the writer lock.
    fn apply_credential(&self, credential: Option<&str>) -> ConfigurationState {
        let _writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let credential = Credential::parse(credential);

        if let Err(e) = self
            .store
            .set_credential(&self.service, credential.as_ref().map(Credential::expose))
        {
            let err = Error::CredentialPersistFailure(e.to_string());
            tracing::warn!(service = %self.service, error = %err, "Continuing with in-memory credential");
        }

        let Some(credential) = credential else {
            if self.write_active().take().is_some() {
                tracing::info!("Credential cleared, analytics disabled");
            }
            return ConfigurationState::Absent;
        };

        let unchanged = self
            .read_active()
            .as_ref()
            .is_some_and(|active| active.credential == credential);
        if unchanged {
            tracing::debug!("Credential unchanged, keeping current sink");
            return ConfigurationState::Configured;
        }

        // Build outside the write lock; recorders keep using the old sink meanwhile.
        let replacement = self.build_sink(credential);
        let state = if replacement.is_some() {
            ConfigurationState::Configured
        } else {
            ConfigurationState::Absent
        };
        let previous = std::mem::replace(&mut *self.write_active(), replacement);
        drop(previous);
        state
    }

    /// Forward `event` to the sink, or drop it when unconfigured.
    pub fn record_event(&self, event: &AnalyticsEvent) {
        let guard = self.read_active();
        match guard.as_ref() {
            Some(active) => active.sink.log_event(
                event.name(),
                event.properties(),
                event.is_out_of_session(),
            ),
            None => tracing::trace!(event = %event.name(), "No sink configured, dropping event"),
        }
    }

    /// Build and forward an event; an invalid name drops it.
    pub fn record(&self, name: &str, properties: Option<Properties>, out_of_session: bool) {
        match AnalyticsEvent::new(name) {
            Ok(event) => {
                let event = match properties {
                    Some(properties) => event.with_properties(properties),
                    None => event,
                };
                self.record_event(&event.out_of_session(out_of_session));
            }
            Err(e) => tracing::debug!(error = %e, "Dropping event"),
        }
    }

    /// Forward a single-property identity update, or drop it when unconfigured.
    pub fn record_identify(&self, identify: &IdentifyTrait) {
        if let Some(active) = self.read_active().as_ref() {
            active.sink.identify(&identify.property, &identify.value);
        }
    }

    pub fn configuration_state(&self) -> ConfigurationState {
        if self.read_active().is_some() {
            ConfigurationState::Configured
        } else {
            ConfigurationState::Absent
        }
    }

    /// Whether setup is complete
    pub fn has_valid_configuration(&self) -> bool {
        self.configuration_state() == ConfigurationState::Configured
    }

    /// Apply a host lifecycle event, then notify listeners.
    pub fn notify(&self, event: LifecycleEvent) {
        let kind = event.kind();
        let state = match event {
            LifecycleEvent::Created { credential } | LifecycleEvent::Updated { credential } => {
                self.apply_credential(Some(&credential))
            }
            LifecycleEvent::Deleted => self.apply_credential(None),
        };
        tracing::info!(?kind, %state, "Service lifecycle changed");

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener.lifecycle_changed(kind, state);
        }
    }

    /// Wait up to `timeout` for the live sink to hand off pending deliveries.
    ///
    /// Returns true when nothing is pending, including when unconfigured.
    pub fn flush(&self, timeout: Duration) -> bool {
        let sink = self
            .read_active()
            .as_ref()
            .map(|active| Arc::clone(&active.sink));
        match sink {
            Some(sink) => sink.flush(timeout),
            None => true,
        }
    }

    fn build_sink(&self, credential: Credential) -> Option<ActiveSink> {
        match self.factory.build(&credential, &self.options) {
            Ok(sink) => {
                tracing::info!(credential = %credential.masked(), "Analytics sink ready");
                Some(ActiveSink { credential, sink })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build analytics sink, analytics disabled");
                None
            }
        }
    }

    fn read_active(&self) -> RwLockReadGuard<'_, Option<ActiveSink>> {
        // Writers only swap whole values, a poisoned slot is still consistent.
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_active(&self) -> RwLockWriteGuard<'_, Option<ActiveSink>> {
        self.active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::sink::{RecordedCall, RecordingSinkFactory};

    fn relay_with(
        store: MemoryCredentialStore,
    ) -> (EventRelay, Arc<MemoryCredentialStore>, Arc<RecordingSinkFactory>) {
        let store = Arc::new(store);
        let factory = Arc::new(RecordingSinkFactory::new());
        let relay = EventRelay::new(store.clone(), factory.clone());
        (relay, store, factory)
    }

    #[test]
    fn test_starts_configured_from_stored_credential() {
        let (relay, _, factory) =
            relay_with(MemoryCredentialStore::with_credential(DEFAULT_CREDENTIAL_SERVICE, "ABC123"));
        assert_eq!(relay.configuration_state(), ConfigurationState::Configured);
        assert_eq!(factory.latest().unwrap().api_key(), "ABC123");
    }

    #[test]
    fn test_stored_empty_credential_is_absent() {
        let (relay, _, factory) =
            relay_with(MemoryCredentialStore::with_credential(DEFAULT_CREDENTIAL_SERVICE, ""));
        assert_eq!(relay.configuration_state(), ConfigurationState::Absent);
        assert_eq!(factory.build_count(), 0);
    }

    #[test]
    fn test_stored_whitespace_credential_is_configured() {
        let (relay, _, factory) =
            relay_with(MemoryCredentialStore::with_credential(DEFAULT_CREDENTIAL_SERVICE, "  "));
        assert_eq!(relay.configuration_state(), ConfigurationState::Configured);
        assert_eq!(factory.latest().unwrap().api_key(), "  ");
    }

    #[test]
    fn test_configure_whitespace_credential_is_configured() {
        let (relay, store, factory) = relay_with(MemoryCredentialStore::new());
        relay.configure(Some(" "));

        assert_eq!(relay.configuration_state(), ConfigurationState::Configured);
        assert_eq!(store.stored(DEFAULT_CREDENTIAL_SERVICE).as_deref(), Some(" "));
        assert_eq!(factory.latest().unwrap().api_key(), " ");
    }

    #[test]
    fn test_configure_persists_and_builds() {
        let (relay, store, factory) = relay_with(MemoryCredentialStore::new());
        relay.configure(Some("ABC123"));

        assert!(relay.has_valid_configuration());
        assert_eq!(
            store.stored(DEFAULT_CREDENTIAL_SERVICE).as_deref(),
            Some("ABC123")
        );
        assert_eq!(
            factory.latest().unwrap().options(),
            PrivacyOptions::restricted()
        );
    }

    #[test]
    fn test_configure_same_credential_keeps_sink() {
        let (relay, _, factory) = relay_with(MemoryCredentialStore::new());
        relay.configure(Some("ABC123"));
        relay.configure(Some("ABC123"));
        assert_eq!(factory.build_count(), 1);

        // Keys are compared as entered
        relay.configure(Some(" ABC123 "));
        assert_eq!(factory.build_count(), 2);
        assert_eq!(factory.latest().unwrap().api_key(), " ABC123 ");

        relay.configure(Some("DEF456"));
        assert_eq!(factory.build_count(), 3);
        assert_eq!(factory.latest().unwrap().api_key(), "DEF456");
    }

    #[test]
    fn test_sink_build_failure_leaves_relay_absent() {
        let store = Arc::new(MemoryCredentialStore::new());
        let relay = EventRelay::new(store.clone(), Arc::new(RecordingSinkFactory::failing()));
        relay.configure(Some("ABC123"));

        assert_eq!(relay.configuration_state(), ConfigurationState::Absent);
        assert_eq!(
            store.stored(DEFAULT_CREDENTIAL_SERVICE).as_deref(),
            Some("ABC123")
        );
    }

    #[test]
    fn test_record_rejects_empty_name_and_keeps_others_verbatim() {
        let (relay, _, factory) = relay_with(MemoryCredentialStore::new());
        relay.configure(Some("ABC123"));

        relay.record("", None, false);
        relay.record(" Pump Paired ", None, false);

        assert_eq!(
            factory.all_calls(),
            vec![RecordedCall::Event {
                name: " Pump Paired ".to_string(),
                properties: None,
                out_of_session: false,
            }]
        );
    }

    #[test]
    fn test_custom_service_name() {
        let store = Arc::new(MemoryCredentialStore::new());
        let relay = EventRelay::with_service(
            store.clone(),
            Arc::new(RecordingSinkFactory::new()),
            "TestKey",
        );
        relay.configure(Some("ABC123"));
        assert_eq!(store.stored("TestKey").as_deref(), Some("ABC123"));
        assert!(store.stored(DEFAULT_CREDENTIAL_SERVICE).is_none());
    }

    #[test]
    fn test_flush_when_absent() {
        let (relay, _, _) = relay_with(MemoryCredentialStore::new());
        assert!(relay.flush(Duration::from_millis(10)));
    }
}
