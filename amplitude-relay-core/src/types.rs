//! Core domain types for amplitude-relay
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Credential** | The Amplitude API key for this application instance |
//! | **Sink** | A live, initialized analytics client built from a Credential |
//! | **Event** | A named occurrence with optional primitive properties |
//! | **Out-of-session** | An event that neither starts nor extends the current session |
//! | **Trait** | A single user property attached to the analytics identity |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

// ============================================
// Credential
// ============================================

/// An Amplitude API key.
///
/// Always non-empty and kept exactly as entered. The key never appears in
/// `Debug` output so it can't leak through structured logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap raw input into a credential.
    ///
    /// Returns `None` for absent and empty input only.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw? {
            "" => None,
            key => Some(Self(key.to_string())),
        }
    }

    /// The raw key, for the store and the sink only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// A display-safe form: the last four characters, the rest masked.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 4 {
            return "*".repeat(chars.len());
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", "*".repeat(chars.len() - 4), tail)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&"<redacted>").finish()
    }
}

/// Whether the relay currently has a usable credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigurationState {
    /// No credential, no sink; events are dropped
    Absent,
    /// A sink built from a non-empty credential is live
    Configured,
}

impl ConfigurationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationState::Absent => "absent",
            ConfigurationState::Configured => "configured",
        }
    }
}

impl fmt::Display for ConfigurationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Events
// ============================================

/// A primitive event property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(i64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl PropertyValue {
    /// Parse a command-line style value: booleans and numbers are recognized,
    /// everything else stays a string.
    pub fn infer(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            return PropertyValue::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return PropertyValue::Int(i);
        }
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => PropertyValue::Float(f),
            _ => PropertyValue::String(raw.to_string()),
        }
    }
}

/// Event properties, ordered by key for stable payloads.
pub type Properties = BTreeMap<String, PropertyValue>;

/// An analytics event, validated at construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct AnalyticsEvent {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<Properties>,
    out_of_session: bool,
}

impl AnalyticsEvent {
    /// Create an in-session event without properties.
    ///
    /// The name is kept as given; an empty name is [`Error::InvalidEvent`].
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidEvent("event name is empty".to_string()));
        }
        Ok(Self {
            name,
            properties: None,
            out_of_session: false,
        })
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties
            .get_or_insert_with(Properties::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn out_of_session(mut self, out_of_session: bool) -> Self {
        self.out_of_session = out_of_session;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> Option<&Properties> {
        self.properties.as_ref()
    }

    pub fn is_out_of_session(&self) -> bool {
        self.out_of_session
    }
}

#[derive(Deserialize)]
struct RawEvent {
    name: String,
    #[serde(default)]
    properties: Option<Properties>,
    #[serde(default)]
    out_of_session: bool,
}

impl TryFrom<RawEvent> for AnalyticsEvent {
    type Error = Error;

    fn try_from(raw: RawEvent) -> Result<Self> {
        let mut event = AnalyticsEvent::new(raw.name)?.out_of_session(raw.out_of_session);
        event.properties = raw.properties;
        Ok(event)
    }
}

// ============================================
// Identity
// ============================================

/// Value of a user trait: a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitValue {
    Single(String),
    List(Vec<String>),
}

impl From<&str> for TraitValue {
    fn from(v: &str) -> Self {
        TraitValue::Single(v.to_string())
    }
}

impl From<String> for TraitValue {
    fn from(v: String) -> Self {
        TraitValue::Single(v)
    }
}

impl From<Vec<String>> for TraitValue {
    fn from(v: Vec<String>) -> Self {
        TraitValue::List(v)
    }
}

/// A single user property to set on the current analytics identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyTrait {
    pub property: String,
    pub value: TraitValue,
}

impl IdentifyTrait {
    pub fn new(property: impl Into<String>, value: impl Into<TraitValue>) -> Self {
        Self {
            property: property.into(),
            value: value.into(),
        }
    }
}

// ============================================
// Host lifecycle
// ============================================

/// Lifecycle notification from the host, carrying whatever the
/// configuration form collected.
#[derive(Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The service was added with a freshly entered key
    Created { credential: String },
    /// The key was edited in settings
    Updated { credential: String },
    /// The service was removed; its credential must be cleared
    Deleted,
}

impl LifecycleEvent {
    pub fn kind(&self) -> LifecycleKind {
        match self {
            LifecycleEvent::Created { .. } => LifecycleKind::Created,
            LifecycleEvent::Updated { .. } => LifecycleKind::Updated,
            LifecycleEvent::Deleted => LifecycleKind::Deleted,
        }
    }
}

impl fmt::Debug for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LifecycleEvent::{:?}", self.kind())
    }
}

/// The state-changed notification delivered to host listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Created,
    Updated,
    Deleted,
}
