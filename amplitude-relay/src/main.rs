//! amplitude-relay - CLI for configuring the Amplitude analytics relay
//!
//! This tool provides commands for:
//! - Entering, replacing and removing the Amplitude API key
//! - Checking whether analytics are configured
//! - Sending a single event or identity update by hand
//!
//! Uses XDG Base Directory specification for file locations:
//! - Credentials: $XDG_DATA_HOME/amplitude-relay/credentials.json
//! - Logs: $XDG_STATE_HOME/amplitude-relay/amplitude-relay.log
//! - Config: $XDG_CONFIG_HOME/amplitude-relay/config.toml

use amplitude_relay_core::credentials::FileCredentialStore;
use amplitude_relay_core::sink::{AmplitudeSinkFactory, RecordedCall, RecordingSinkFactory, SinkFactory};
use amplitude_relay_core::{
    AnalyticsEvent, Config, ConfigurationState, Credential, EventRelay, IdentifyTrait,
    LifecycleEvent, LifecycleKind, LifecycleListener, Properties, PropertyValue, TraitValue,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "amplitude-relay")]
#[command(about = "Configure and exercise the Amplitude analytics relay")]
#[command(version)]
struct Args {
    /// Write logs to the XDG state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show relay configuration and state
    Status,

    /// Enter the API key for a new setup
    Setup {
        /// Amplitude API key
        #[arg(long)]
        api_key: String,
    },

    /// Replace the stored API key
    Update {
        /// Amplitude API key
        #[arg(long)]
        api_key: String,
    },

    /// Remove the stored API key
    Delete,

    /// Record one event
    Track {
        /// Event name
        name: String,

        /// Event property as key=value (repeatable)
        #[arg(short, long = "property", value_parser = parse_property)]
        properties: Vec<(String, PropertyValue)>,

        /// Record outside the current session
        #[arg(long)]
        out_of_session: bool,

        /// Print what would be sent instead of sending it
        #[arg(long)]
        dry_run: bool,

        /// Seconds to wait for delivery before exiting
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Set a user property on the analytics identity
    Identify {
        /// User property name
        property: String,

        /// One value, or several for a list
        #[arg(required = true)]
        values: Vec<String>,

        /// Print what would be sent instead of sending it
        #[arg(long)]
        dry_run: bool,

        /// Seconds to wait for delivery before exiting
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

/// Prints lifecycle changes the way a settings screen would refresh.
struct ConsoleListener;

impl LifecycleListener for ConsoleListener {
    fn lifecycle_changed(&self, kind: LifecycleKind, state: ConfigurationState) {
        let verb = match kind {
            LifecycleKind::Created => "created",
            LifecycleKind::Updated => "updated",
            LifecycleKind::Deleted => "deleted",
        };
        println!("Amplitude service {} (state: {})", verb, state);
    }
}

fn parse_property(raw: &str) -> std::result::Result<(String, PropertyValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("property key must not be empty".to_string());
    }
    Ok((key.to_string(), PropertyValue::infer(value)))
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(
            amplitude_relay_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    tracing::info!(config = %Config::config_path().display(), "amplitude-relay starting");

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Setup { api_key } => cmd_lifecycle(&config, Some(api_key), true),
        Command::Update { api_key } => cmd_lifecycle(&config, Some(api_key), false),
        Command::Delete => cmd_lifecycle(&config, None, false),
        Command::Track {
            name,
            properties,
            out_of_session,
            dry_run,
            timeout,
        } => cmd_track(&config, &name, properties, out_of_session, dry_run, timeout),
        Command::Identify {
            property,
            mut values,
            dry_run,
            timeout,
        } => {
            let value = if values.len() == 1 {
                TraitValue::Single(values.remove(0))
            } else {
                TraitValue::List(values)
            };
            cmd_identify(&config, IdentifyTrait::new(property, value), dry_run, timeout)
        }
    }
}

fn credential_store(config: &Config) -> Arc<FileCredentialStore> {
    Arc::new(FileCredentialStore::new(config.credentials.store_path()))
}

fn amplitude_relay(config: &Config) -> Result<EventRelay> {
    let factory = AmplitudeSinkFactory::new(config.amplitude.clone())
        .context("invalid [amplitude] configuration")?;
    Ok(build_relay(config, Arc::new(factory)))
}

fn build_relay(config: &Config, factory: Arc<dyn SinkFactory>) -> EventRelay {
    EventRelay::with_service(
        credential_store(config),
        factory,
        config.credentials.service.clone(),
    )
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Amplitude Relay Configuration");
    println!("=============================");
    println!();

    // A recording factory avoids starting a network worker just to look.
    let relay = build_relay(config, Arc::new(RecordingSinkFactory::new()));
    let state = relay.configuration_state();

    println!("State:           {}", state);
    println!(
        "Credential file: {}",
        config.credentials.store_path().display()
    );
    println!("Service:         {}", config.credentials.service);
    println!("Server URL:      {}", config.amplitude.server_url);
    println!("Timeout:         {}s", config.amplitude.timeout_secs);
    println!("Session Timeout: {}s", config.amplitude.session_timeout_secs);

    if state == ConfigurationState::Absent {
        println!();
        println!("Analytics are disabled. Enter an API key with:");
        println!();
        println!("  amplitude-relay setup --api-key <KEY>");
    }

    Ok(())
}

fn cmd_lifecycle(config: &Config, api_key: Option<String>, create: bool) -> Result<()> {
    let event = match api_key {
        Some(key) => {
            let credential = Credential::parse(Some(&key))
                .ok_or_else(|| anyhow::anyhow!("API key must not be empty"))?;
            let credential = credential.expose().to_string();
            if create {
                LifecycleEvent::Created { credential }
            } else {
                LifecycleEvent::Updated { credential }
            }
        }
        None => LifecycleEvent::Deleted,
    };

    // Only the stored key matters here; no events are sent.
    let relay = build_relay(config, Arc::new(RecordingSinkFactory::new()));
    relay.add_listener(Arc::new(ConsoleListener));
    relay.notify(event);

    Ok(())
}

fn cmd_track(
    config: &Config,
    name: &str,
    properties: Vec<(String, PropertyValue)>,
    out_of_session: bool,
    dry_run: bool,
    timeout: u64,
) -> Result<()> {
    let mut event = AnalyticsEvent::new(name).context("cannot record event")?;
    if !properties.is_empty() {
        event = event.with_properties(properties.into_iter().collect::<Properties>());
    }
    let event = event.out_of_session(out_of_session);

    if dry_run {
        let factory = Arc::new(RecordingSinkFactory::new());
        let relay = build_relay(config, factory.clone());
        relay.record_event(&event);
        return print_recorded(&relay, &factory);
    }

    let relay = amplitude_relay(config)?;
    if !relay.has_valid_configuration() {
        println!("Analytics not configured; event dropped.");
        return Ok(());
    }

    relay.record_event(&event);
    report_flush(&relay, timeout);
    Ok(())
}

fn cmd_identify(config: &Config, identify: IdentifyTrait, dry_run: bool, timeout: u64) -> Result<()> {
    if dry_run {
        let factory = Arc::new(RecordingSinkFactory::new());
        let relay = build_relay(config, factory.clone());
        relay.record_identify(&identify);
        return print_recorded(&relay, &factory);
    }

    let relay = amplitude_relay(config)?;
    if !relay.has_valid_configuration() {
        println!("Analytics not configured; identify dropped.");
        return Ok(());
    }

    relay.record_identify(&identify);
    report_flush(&relay, timeout);
    Ok(())
}

fn print_recorded(relay: &EventRelay, factory: &RecordingSinkFactory) -> Result<()> {
    if !relay.has_valid_configuration() {
        println!("Analytics not configured; nothing would be sent.");
        return Ok(());
    }

    for call in factory.all_calls() {
        let rendered = match call {
            RecordedCall::Event {
                name,
                properties,
                out_of_session,
            } => serde_json::json!({
                "event": name,
                "properties": properties,
                "out_of_session": out_of_session,
            }),
            RecordedCall::Identify { property, value } => serde_json::json!({
                "identify": property,
                "value": value,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    }
    Ok(())
}

fn report_flush(relay: &EventRelay, timeout: u64) {
    if relay.flush(Duration::from_secs(timeout)) {
        println!("Sent.");
    } else {
        println!("Delivery still pending after {}s; giving up.", timeout);
    }
}
