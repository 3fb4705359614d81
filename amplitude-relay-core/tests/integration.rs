//! Integration tests for the event relay
//!
//! These drive [`EventRelay`] end to end with the recording sink and both
//! credential stores, covering configuration transitions, forwarding,
//! degraded stores and concurrent use.

use amplitude_relay_core::credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
use amplitude_relay_core::relay::DEFAULT_CREDENTIAL_SERVICE;
use amplitude_relay_core::sink::{PrivacyOptions, RecordedCall, RecordingSinkFactory};
use amplitude_relay_core::{
    AnalyticsEvent, ConfigurationState, EventRelay, IdentifyTrait, LifecycleEvent,
    LifecycleKind, LifecycleListener, Properties, PropertyValue, TraitValue,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;

fn memory_relay() -> (EventRelay, Arc<MemoryCredentialStore>, Arc<RecordingSinkFactory>) {
    let store = Arc::new(MemoryCredentialStore::new());
    let factory = Arc::new(RecordingSinkFactory::new());
    let relay = EventRelay::new(store.clone(), factory.clone());
    (relay, store, factory)
}

fn event_call(name: &str, properties: Option<Properties>, out_of_session: bool) -> RecordedCall {
    RecordedCall::Event {
        name: name.to_string(),
        properties,
        out_of_session,
    }
}

#[derive(Default)]
struct RecordingListener {
    seen: Mutex<Vec<(LifecycleKind, ConfigurationState)>>,
}

impl LifecycleListener for RecordingListener {
    fn lifecycle_changed(&self, kind: LifecycleKind, state: ConfigurationState) {
        self.seen.lock().unwrap().push((kind, state));
    }
}

// ============================================
// Configuration state
// ============================================

#[test]
fn test_configure_nonempty_is_configured() {
    let (relay, _, _) = memory_relay();
    for key in ["ABC123", "x", "  padded  ", "ünïcödé-key"] {
        relay.configure(Some(key));
        assert_eq!(relay.configuration_state(), ConfigurationState::Configured);
    }
}

#[test]
fn test_configure_absent_is_absent_regardless_of_prior_state() {
    let (relay, store, _) = memory_relay();

    relay.configure(None);
    assert_eq!(relay.configuration_state(), ConfigurationState::Absent);

    relay.configure(Some("ABC123"));
    relay.configure(None);
    assert_eq!(relay.configuration_state(), ConfigurationState::Absent);
    assert!(store.stored(DEFAULT_CREDENTIAL_SERVICE).is_none());

    relay.configure(Some("ABC123"));
    relay.configure(Some(""));
    assert_eq!(relay.configuration_state(), ConfigurationState::Absent);
}

#[test]
fn test_reconfigurable_indefinitely() {
    let (relay, _, factory) = memory_relay();
    for i in 0..20 {
        relay.configure(Some(&format!("key-{}", i)));
        assert!(relay.has_valid_configuration());
        relay.configure(None);
        assert!(!relay.has_valid_configuration());
    }
    assert_eq!(factory.build_count(), 20);
}

// ============================================
// Forwarding
// ============================================

#[test]
fn test_loop_success_out_of_session_scenario() {
    let (relay, _, factory) = memory_relay();
    relay.configure(Some("ABC123"));

    let event = AnalyticsEvent::new("Loop success").unwrap().out_of_session(true);
    relay.record_event(&event);

    let sink = factory.latest().unwrap();
    assert_eq!(sink.api_key(), "ABC123");
    assert_eq!(sink.calls(), vec![event_call("Loop success", None, true)]);
}

#[test]
fn test_bolus_retry_dropped_when_absent() {
    let (relay, _, factory) = memory_relay();
    relay.configure(None);

    relay.record_event(&AnalyticsEvent::new("Bolus Retry").unwrap());
    relay.record_identify(&IdentifyTrait::new("Units", "mg/dL"));

    assert_eq!(factory.build_count(), 0);
    assert!(factory.all_calls().is_empty());
}

#[test]
fn test_events_after_clearing_are_dropped() {
    let (relay, _, factory) = memory_relay();
    relay.configure(Some("ABC123"));
    relay.record_event(&AnalyticsEvent::new("Before").unwrap());
    relay.configure(None);
    relay.record_event(&AnalyticsEvent::new("After").unwrap());

    assert_eq!(factory.all_calls(), vec![event_call("Before", None, false)]);
}

#[test]
fn test_properties_forwarded_verbatim() {
    let (relay, _, factory) = memory_relay();
    relay.configure(Some("ABC123"));

    let mut properties = Properties::new();
    properties.insert("units".to_string(), PropertyValue::from(1.25));
    properties.insert("automatic".to_string(), PropertyValue::from(true));
    properties.insert("source".to_string(), PropertyValue::from("watch"));
    properties.insert("attempt".to_string(), PropertyValue::from(3i64));

    let event = AnalyticsEvent::new("Bolus Enacted")
        .unwrap()
        .with_properties(properties.clone());
    relay.record_event(&event);

    assert_eq!(
        factory.all_calls(),
        vec![event_call("Bolus Enacted", Some(properties), false)]
    );
}

#[test]
fn test_each_event_delivered_exactly_once() {
    let (relay, _, factory) = memory_relay();
    relay.configure(Some("ABC123"));
    relay.configure(Some("ABC123"));

    let names = ["Loop success", "Bolus Retry", "Pump Paired", "CGM Added"];
    for name in names {
        relay.record_event(&AnalyticsEvent::new(name).unwrap());
    }

    let calls = factory.all_calls();
    assert_eq!(calls.len(), names.len());
    for (call, name) in calls.iter().zip(names) {
        assert_eq!(call, &event_call(name, None, false));
    }
}

#[test]
fn test_identify_forwarded() {
    let (relay, _, factory) = memory_relay();
    relay.configure(Some("ABC123"));

    relay.record_identify(&IdentifyTrait::new(
        "Devices",
        vec!["Omnipod".to_string(), "Dexcom G7".to_string()],
    ));

    assert_eq!(
        factory.all_calls(),
        vec![RecordedCall::Identify {
            property: "Devices".to_string(),
            value: TraitValue::List(vec!["Omnipod".to_string(), "Dexcom G7".to_string()]),
        }]
    );
}

#[test]
fn test_new_credential_routes_to_new_sink() {
    let (relay, _, factory) = memory_relay();
    relay.configure(Some("OLD"));
    relay.record_event(&AnalyticsEvent::new("First").unwrap());
    relay.configure(Some("NEW"));
    relay.record_event(&AnalyticsEvent::new("Second").unwrap());

    let sinks = factory.sinks();
    assert_eq!(sinks.len(), 2);
    assert_eq!(sinks[0].calls(), vec![event_call("First", None, false)]);
    assert_eq!(sinks[1].calls(), vec![event_call("Second", None, false)]);
    assert_eq!(sinks[1].options(), PrivacyOptions::restricted());
}

// ============================================
// Degraded stores
// ============================================

#[test]
fn test_startup_read_failure_is_absent() {
    let store = Arc::new(
        MemoryCredentialStore::with_credential(DEFAULT_CREDENTIAL_SERVICE, "ABC123")
            .failing_reads(),
    );
    let factory = Arc::new(RecordingSinkFactory::new());
    let relay = EventRelay::new(store, factory.clone());

    assert_eq!(relay.configuration_state(), ConfigurationState::Absent);
    assert_eq!(factory.build_count(), 0);
}

#[test]
fn test_persist_failure_still_transitions() {
    let store = Arc::new(MemoryCredentialStore::new().failing_writes());
    let factory = Arc::new(RecordingSinkFactory::new());
    let relay = EventRelay::new(store.clone(), factory.clone());

    relay.configure(Some("ABC123"));
    assert_eq!(relay.configuration_state(), ConfigurationState::Configured);
    assert!(store.stored(DEFAULT_CREDENTIAL_SERVICE).is_none());

    relay.notify(LifecycleEvent::Deleted);
    assert_eq!(relay.configuration_state(), ConfigurationState::Absent);
}

#[test]
fn test_file_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("credentials.json");

    {
        let relay = EventRelay::new(
            Arc::new(FileCredentialStore::new(&path)),
            Arc::new(RecordingSinkFactory::new()),
        );
        relay.configure(Some("ABC123"));
    }

    let factory = Arc::new(RecordingSinkFactory::new());
    let relay = EventRelay::new(Arc::new(FileCredentialStore::new(&path)), factory.clone());
    assert!(relay.has_valid_configuration());
    assert_eq!(factory.latest().unwrap().api_key(), "ABC123");

    relay.configure(None);
    let store = FileCredentialStore::new(&path);
    assert!(store.get_credential(DEFAULT_CREDENTIAL_SERVICE).is_err());
}

#[test]
fn test_corrupt_file_store_starts_absent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("credentials.json");
    std::fs::write(&path, "{ not json").unwrap();

    let relay = EventRelay::new(
        Arc::new(FileCredentialStore::new(&path)),
        Arc::new(RecordingSinkFactory::new()),
    );
    assert_eq!(relay.configuration_state(), ConfigurationState::Absent);
}

// ============================================
// Host lifecycle
// ============================================

#[test]
fn test_lifecycle_notifications() {
    let (relay, store, _) = memory_relay();
    let listener = Arc::new(RecordingListener::default());
    relay.add_listener(listener.clone());

    relay.notify(LifecycleEvent::Created {
        credential: "ABC123".to_string(),
    });
    assert_eq!(
        store.stored(DEFAULT_CREDENTIAL_SERVICE).as_deref(),
        Some("ABC123")
    );

    relay.notify(LifecycleEvent::Updated {
        credential: "DEF456".to_string(),
    });
    assert_eq!(
        store.stored(DEFAULT_CREDENTIAL_SERVICE).as_deref(),
        Some("DEF456")
    );

    relay.notify(LifecycleEvent::Deleted);
    assert!(store.stored(DEFAULT_CREDENTIAL_SERVICE).is_none());

    assert_eq!(
        *listener.seen.lock().unwrap(),
        vec![
            (LifecycleKind::Created, ConfigurationState::Configured),
            (LifecycleKind::Updated, ConfigurationState::Configured),
            (LifecycleKind::Deleted, ConfigurationState::Absent),
        ]
    );
}

#[test]
fn test_update_with_empty_key_clears() {
    let (relay, _, _) = memory_relay();
    relay.notify(LifecycleEvent::Created {
        credential: "ABC123".to_string(),
    });
    relay.notify(LifecycleEvent::Updated {
        credential: String::new(),
    });
    assert_eq!(relay.configuration_state(), ConfigurationState::Absent);
}

#[test]
fn test_update_with_whitespace_key_stays_configured() {
    let (relay, store, factory) = memory_relay();
    relay.notify(LifecycleEvent::Created {
        credential: "ABC123".to_string(),
    });
    relay.notify(LifecycleEvent::Updated {
        credential: "   ".to_string(),
    });
    assert_eq!(relay.configuration_state(), ConfigurationState::Configured);
    assert_eq!(
        store.stored(DEFAULT_CREDENTIAL_SERVICE).as_deref(),
        Some("   ")
    );
    assert_eq!(factory.latest().unwrap().api_key(), "   ");
}

// ============================================
// Concurrency
// ============================================

#[test]
fn test_concurrent_record_and_configure() {
    let (relay, _, factory) = memory_relay();
    let relay = Arc::new(relay);
    relay.configure(Some("key-0"));

    let stop = Arc::new(AtomicBool::new(false));
    let mut recorders = Vec::new();
    for t in 0..4 {
        let relay = Arc::clone(&relay);
        let stop = Arc::clone(&stop);
        recorders.push(thread::spawn(move || {
            let mut sent = 0usize;
            while !stop.load(Ordering::Relaxed) {
                relay.record_event(&AnalyticsEvent::new(format!("event-{}", t)).unwrap());
                sent += 1;
            }
            sent
        }));
    }

    for i in 1..50 {
        relay.configure(Some(&format!("key-{}", i)));
    }
    relay.configure(Some("final"));
    stop.store(true, Ordering::Relaxed);

    let sent: usize = recorders.into_iter().map(|h| h.join().unwrap()).sum();

    // Every event landed on exactly one fully built sink
    assert_eq!(factory.all_calls().len(), sent);
    assert_eq!(factory.latest().unwrap().api_key(), "final");
    assert_eq!(relay.configuration_state(), ConfigurationState::Configured);
}

#[test]
fn test_concurrent_configure_ends_consistent() {
    let (relay, store, _) = memory_relay();
    let relay = Arc::new(relay);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                if i % 2 == 0 {
                    relay.configure(Some(&format!("key-{}", i)));
                } else {
                    relay.configure(None);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // The store and the in-memory state agree on whoever wrote last
    let stored = store.stored(DEFAULT_CREDENTIAL_SERVICE);
    assert_eq!(stored.is_some(), relay.has_valid_configuration());
}

#[test]
fn test_concurrent_notify_reports_own_transition() {
    let (relay, _, _) = memory_relay();
    let relay = Arc::new(relay);
    let listener = Arc::new(RecordingListener::default());
    relay.add_listener(listener.clone());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                for round in 0..25 {
                    let event = match (i + round) % 3 {
                        0 => LifecycleEvent::Created {
                            credential: format!("key-{}-{}", i, round),
                        },
                        1 => LifecycleEvent::Updated {
                            credential: format!("key-{}-{}", i, round),
                        },
                        _ => LifecycleEvent::Deleted,
                    };
                    relay.notify(event);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Each listener call carries the state its own notification produced,
    // never one left behind by a concurrent writer
    let seen = listener.seen.lock().unwrap();
    assert_eq!(seen.len(), 8 * 25);
    for (kind, state) in seen.iter() {
        let expected = match kind {
            LifecycleKind::Created | LifecycleKind::Updated => ConfigurationState::Configured,
            LifecycleKind::Deleted => ConfigurationState::Absent,
        };
        assert_eq!(*state, expected, "{:?} reported {:?}", kind, state);
    }
}
