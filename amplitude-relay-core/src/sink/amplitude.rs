//! Amplitude HTTP API sink
//!
//! Events are POSTed one at a time to `/2/httpapi`; identity updates go to
//! `/identify` as a form-encoded `$set`. Callers only enqueue onto a channel;
//! a dedicated worker thread running a current-thread tokio runtime performs
//! the requests in order. Failed requests are logged and dropped.
//!
//! ## Sessions
//!
//! In-session events share a `session_id` (the start time in milliseconds)
//! until `session_timeout_secs` pass without one. Out-of-session events are
//! sent with `session_id = -1` and leave the session clock untouched.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::config::{AmplitudeConfig, Config};
use crate::error::{Error, Result};
use crate::types::{Credential, Properties, TraitValue};

use super::{AnalyticsSink, PrivacyOptions, SinkFactory};

/// Session id Amplitude reserves for events outside any session
const OUT_OF_SESSION_ID: i64 = -1;

/// File under the data directory holding the generated device id
const DEVICE_ID_FILE: &str = "device_id";

/// Amplitude rejects device ids shorter than this
const MIN_DEVICE_ID_LEN: usize = 5;

// ============================================
// Device context
// ============================================

/// Device-level fields attached to every upload.
///
/// Hosts may fill in the optional fields; [`DeviceContext::apply`] clears
/// whatever the privacy options forbid.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceContext {
    pub device_id: String,
    pub platform: String,
    pub os_name: String,
    pub app_version: Option<String>,
    pub carrier: Option<String>,
    pub city: Option<String>,
    pub location_lat: Option<f64>,
    pub location_lng: Option<f64>,
    pub idfa: Option<String>,
    /// `$remote` lets the backend derive coarse location from the request IP
    pub ip: Option<String>,
}

impl DeviceContext {
    pub fn from_config(config: &AmplitudeConfig, device_id: String) -> Self {
        Self {
            device_id,
            platform: config.platform.clone(),
            os_name: config.os_name.clone(),
            app_version: config.app_version.clone(),
            carrier: None,
            city: None,
            location_lat: None,
            location_lng: None,
            idfa: None,
            ip: Some("$remote".to_string()),
        }
    }

    /// Drop every field the options disable.
    pub fn apply(&mut self, options: &PrivacyOptions) {
        if options.disable_advertising_id {
            self.idfa = None;
        }
        if options.disable_coarse_location {
            self.ip = None;
        }
        if options.disable_city {
            self.city = None;
        }
        if options.disable_carrier {
            self.carrier = None;
        }
        if options.disable_lat_lng {
            self.location_lat = None;
            self.location_lng = None;
        }
    }
}

/// Read the device id stored under `data_dir`, generating and storing one
/// on first use.
///
/// A stored id that is too short to be accepted upstream is replaced.
pub fn persistent_device_id(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(DEVICE_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let stored = contents.trim();
            if stored.chars().count() >= MIN_DEVICE_ID_LEN {
                return Ok(stored.to_string());
            }
            tracing::warn!(path = %path.display(), "Stored device id is unusable, regenerating");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let device_id = uuid::Uuid::new_v4().to_string();
    fs::create_dir_all(data_dir)?;
    fs::write(&path, format!("{}\n", device_id))?;
    tracing::info!(path = %path.display(), "Generated device id");
    Ok(device_id)
}

// ============================================
// Wire payloads
// ============================================

/// One event in the `/2/httpapi` upload body
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventPayload {
    pub device_id: String,
    pub event_type: String,
    /// Milliseconds since the Unix epoch
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_properties: Option<Properties>,
    pub session_id: i64,
    /// Backend deduplication key
    pub insert_id: String,
    pub platform: String,
    pub os_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idfa: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl EventPayload {
    pub fn new(
        device: &DeviceContext,
        name: &str,
        properties: Option<&Properties>,
        time: i64,
        session_id: i64,
        seq: u64,
    ) -> Self {
        let insert_id = compute_insert_id(&device.device_id, name, time, session_id, seq, properties);
        Self {
            device_id: device.device_id.clone(),
            event_type: name.to_string(),
            time,
            event_properties: properties.cloned(),
            session_id,
            insert_id,
            platform: device.platform.clone(),
            os_name: device.os_name.clone(),
            app_version: device.app_version.clone(),
            carrier: device.carrier.clone(),
            city: device.city.clone(),
            location_lat: device.location_lat,
            location_lng: device.location_lng,
            idfa: device.idfa.clone(),
            ip: device.ip.clone(),
        }
    }
}

/// One entry of the `/identify` `identification` form field
#[derive(Debug, Clone, Serialize, PartialEq)]
struct IdentifyPayload {
    device_id: String,
    user_properties: serde_json::Value,
    platform: String,
    os_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_version: Option<String>,
}

impl IdentifyPayload {
    fn new(device: &DeviceContext, property: &str, value: &TraitValue) -> Self {
        Self {
            device_id: device.device_id.clone(),
            user_properties: serde_json::json!({ "$set": { property: value } }),
            platform: device.platform.clone(),
            os_name: device.os_name.clone(),
            app_version: device.app_version.clone(),
        }
    }
}

/// Request body for POST /2/httpapi
#[derive(Serialize)]
struct UploadRequest<'a> {
    api_key: &'a str,
    events: &'a [EventPayload],
}

/// Content hash used as `insert_id` (32-char hex)
///
/// `seq` separates otherwise identical events recorded in the same millisecond.
fn compute_insert_id(
    device_id: &str,
    name: &str,
    time: i64,
    session_id: i64,
    seq: u64,
    properties: Option<&Properties>,
) -> String {
    let props = properties
        .and_then(|p| serde_json::to_string(p).ok())
        .unwrap_or_default();
    let hash_input = format!(
        "{}:{}:{}:{}:{}:{}",
        device_id, name, time, session_id, seq, props
    );

    let mut hasher = Sha256::new();
    hasher.update(hash_input.as_bytes());
    let result = hasher.finalize();

    hex::encode(&result[..16])
}

// ============================================
// Session clock
// ============================================

#[derive(Debug)]
struct SessionClock {
    timeout_ms: i64,
    current: Option<i64>,
    last_event_ms: i64,
}

impl SessionClock {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            current: None,
            last_event_ms: 0,
        }
    }

    fn session_for(&mut self, now_ms: i64, out_of_session: bool) -> i64 {
        if out_of_session {
            return OUT_OF_SESSION_ID;
        }
        let session_id = match self.current {
            Some(id) if now_ms.saturating_sub(self.last_event_ms) <= self.timeout_ms => id,
            _ => now_ms,
        };
        self.current = Some(session_id);
        self.last_event_ms = now_ms;
        session_id
    }
}

// ============================================
// HTTP client
// ============================================

/// HTTP client for the Amplitude ingestion API
struct ApiClient {
    http_client: reqwest::Client,
    api_key: String,
    events_url: String,
    identify_url: String,
}

impl ApiClient {
    fn new(config: &AmplitudeConfig, credential: &Credential) -> Result<Self> {
        let base_url = config.server_url.trim().trim_end_matches('/').to_string();

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Sink(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            api_key: credential.expose().to_string(),
            events_url: format!("{}/2/httpapi", base_url),
            identify_url: format!("{}/identify", base_url),
        })
    }

    async fn send_event(&self, payload: &EventPayload) -> Result<()> {
        let request_body = UploadRequest {
            api_key: &self.api_key,
            events: std::slice::from_ref(payload),
        };

        let response = self
            .http_client
            .post(&self.events_url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| Error::Sink(format!("HTTP request failed: {}", e)))?;

        check_status(response).await
    }

    async fn send_identify(&self, payload: &IdentifyPayload) -> Result<()> {
        let identification = serde_json::to_string(std::slice::from_ref(payload))?;
        let form = [
            ("api_key", self.api_key.as_str()),
            ("identification", identification.as_str()),
        ];

        let response = self
            .http_client
            .post(&self.identify_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Sink(format!("HTTP request failed: {}", e)))?;

        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(Error::Sink(format!("API error ({}): {}", status, error_text)))
}

// ============================================
// Sink
// ============================================

enum Command {
    Event(EventPayload),
    Identify(IdentifyPayload),
    Flush(std_mpsc::Sender<()>),
}

async fn run_worker(client: ApiClient, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Event(payload) => match client.send_event(&payload).await {
                Ok(()) => tracing::debug!(
                    event = %payload.event_type,
                    session_id = payload.session_id,
                    "Delivered event to Amplitude"
                ),
                Err(e) => tracing::warn!(
                    event = %payload.event_type,
                    error = %e,
                    "Failed to deliver event to Amplitude"
                ),
            },
            Command::Identify(payload) => {
                if let Err(e) = client.send_identify(&payload).await {
                    tracing::warn!(error = %e, "Failed to deliver identify to Amplitude");
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::debug!("Amplitude sink worker stopped");
}

/// Sink delivering to the Amplitude HTTP API.
///
/// Dropping the sink closes its queue; the worker finishes what was already
/// handed off and exits.
pub struct AmplitudeSink {
    device: DeviceContext,
    session: Mutex<SessionClock>,
    seq: AtomicU64,
    tx: mpsc::UnboundedSender<Command>,
}

impl AmplitudeSink {
    /// Build a sink; `options` are applied before the worker starts.
    pub fn new(
        config: &AmplitudeConfig,
        credential: &Credential,
        mut device: DeviceContext,
        options: &PrivacyOptions,
    ) -> Result<Self> {
        device.apply(options);

        let client = ApiClient::new(config, credential)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Sink(format!("failed to create runtime: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("amplitude-sink".to_string())
            .spawn(move || runtime.block_on(run_worker(client, rx)))
            .map_err(|e| Error::Sink(format!("failed to start sink worker: {}", e)))?;

        tracing::info!(
            device_id = %device.device_id,
            server = %config.server_url,
            "Amplitude sink initialized"
        );

        Ok(Self {
            device,
            session: Mutex::new(SessionClock::new(Duration::from_secs(
                config.session_timeout_secs,
            ))),
            seq: AtomicU64::new(0),
            tx,
        })
    }

    /// Device context after privacy options were applied
    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    fn enqueue(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Amplitude sink worker is gone, dropping call");
        }
    }
}

impl AnalyticsSink for AmplitudeSink {
    fn log_event(&self, name: &str, properties: Option<&Properties>, out_of_session: bool) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let session_id = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .session_for(now_ms, out_of_session);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let payload = EventPayload::new(&self.device, name, properties, now_ms, session_id, seq);
        self.enqueue(Command::Event(payload));
    }

    fn identify(&self, property: &str, value: &TraitValue) {
        self.enqueue(Command::Identify(IdentifyPayload::new(
            &self.device,
            property,
            value,
        )));
    }

    /// Blocks the calling thread for at most `timeout`.
    fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = std_mpsc::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

/// Factory building [`AmplitudeSink`]s from one configuration.
pub struct AmplitudeSinkFactory {
    config: AmplitudeConfig,
    device: DeviceContext,
}

impl AmplitudeSinkFactory {
    /// Returns an error if the configuration is invalid.
    ///
    /// Without a configured `device_id`, the id persisted in
    /// [`Config::data_dir`] is used.
    pub fn new(config: AmplitudeConfig) -> Result<Self> {
        Self::with_data_dir(config, &Config::data_dir())
    }

    /// Like [`AmplitudeSinkFactory::new`], persisting the device id under
    /// `data_dir`.
    ///
    /// If the id can't be persisted, a random one is used for this factory
    /// only.
    pub fn with_data_dir(config: AmplitudeConfig, data_dir: &Path) -> Result<Self> {
        config.validate()?;
        let device_id = match &config.device_id {
            Some(id) => id.clone(),
            None => persistent_device_id(data_dir).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to persist device id, using a temporary one");
                uuid::Uuid::new_v4().to_string()
            }),
        };
        let device = DeviceContext::from_config(&config, device_id);
        Ok(Self { config, device })
    }

    /// Replace the device context used for new sinks
    pub fn with_device_context(mut self, device: DeviceContext) -> Self {
        self.device = device;
        self
    }

    pub fn device_context(&self) -> &DeviceContext {
        &self.device
    }
}

impl SinkFactory for AmplitudeSinkFactory {
    fn build(
        &self,
        credential: &Credential,
        options: &PrivacyOptions,
    ) -> Result<Arc<dyn AnalyticsSink>> {
        let sink = AmplitudeSink::new(&self.config, credential, self.device.clone(), options)?;
        Ok(Arc::new(sink))
    }
}
