//! Location-scoped configuration.
//!
//! ```toml
//! arena_size = "8m"
//!
//! [defaults]
//! server = "tcp://governor:10004"
//! max_delay = "5s"
//!
//! [locations.api]
//! enabled = true
//! domain = "api"
//! identifier = "$http_x_api_key"
//! ```
//!
//! A location inherits every unset field from `[defaults]`, which in turn
//! inherits from the built-in defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use delay_store::DEFAULT_ARENA_SIZE;
use http::StatusCode;
use serde::Deserialize;
use serde::Deserializer;

use crate::error::ConfigError;
use crate::expression::Expression;
use crate::registry::MasterRegistry;

pub const DEFAULT_SERVER: &str = "tcp://localhost:10004";
pub const DEFAULT_DOMAIN: &str = "default";
pub const DEFAULT_IDENTIFIER: &str = "$remote_addr";
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(5000);
pub const DEFAULT_REJECT_STATUS: u16 = 503;
pub const DEFAULT_ACCOUNTING_QUEUE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatekeeperConfig {
    /// Byte budget of the shared delay store.
    #[serde(deserialize_with = "deserialize_size")]
    pub arena_size: usize,
    /// Events buffered per governor before accounting starts dropping.
    pub accounting_queue: usize,
    /// Ask every governor to re-push its delays once connected.
    pub resync_on_start: bool,
    pub defaults: LocationSettings,
    pub locations: BTreeMap<String, LocationSettings>,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            accounting_queue: DEFAULT_ACCOUNTING_QUEUE,
            resync_on_start: true,
            defaults: LocationSettings::default(),
            locations: BTreeMap::new(),
        }
    }
}

/// Settings of one location; `None` means inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocationSettings {
    pub enabled: Option<bool>,
    pub server: Option<String>,
    pub domain: Option<String>,
    pub identifier: Option<String>,
    pub log_info: Option<String>,
    #[serde(deserialize_with = "deserialize_delay")]
    pub max_delay: Option<Duration>,
    pub reject_status: Option<u16>,
}

impl LocationSettings {
    /// Fills every unset field from `parent`.
    pub fn merged_over(&self, parent: &LocationSettings) -> LocationSettings {
        LocationSettings {
            enabled: self.enabled.or(parent.enabled),
            server: self.server.clone().or_else(|| parent.server.clone()),
            domain: self.domain.clone().or_else(|| parent.domain.clone()),
            identifier: self.identifier.clone().or_else(|| parent.identifier.clone()),
            log_info: self.log_info.clone().or_else(|| parent.log_info.clone()),
            max_delay: self.max_delay.or(parent.max_delay),
            reject_status: self.reject_status.or(parent.reject_status),
        }
    }
}

/// A location ready for the request path.
#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub name: String,
    pub enabled: bool,
    /// Index into the [`MasterRegistry`]; `None` for disabled locations.
    pub master: Option<usize>,
    pub domain: String,
    pub identifier: Expression,
    pub log_info: Expression,
    pub max_delay: Duration,
    pub reject_status: StatusCode,
}

impl LocationConfig {
    pub fn max_delay_ms(&self) -> u64 {
        u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub registry: MasterRegistry,
    pub locations: BTreeMap<String, Arc<LocationConfig>>,
    pub arena_size: usize,
    pub accounting_queue: usize,
    pub resync_on_start: bool,
}

impl CompiledConfig {
    pub fn location(&self, name: &str) -> Result<Arc<LocationConfig>, ConfigError> {
        self.locations
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownLocation(name.to_string()))
    }
}

impl GatekeeperConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::Load(err.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Load(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Resolves every location and builds the [`MasterRegistry`].
    ///
    /// All locations are validated; only enabled ones are routed to a
    /// governor.
    pub fn compile(&self) -> Result<CompiledConfig, ConfigError> {
        let defaults = self.defaults.merged_over(&builtin_defaults());
        let mut registry = MasterRegistry::default();
        let mut locations = BTreeMap::new();

        for (name, settings) in &self.locations {
            let settings = settings.merged_over(&defaults);
            let location = resolve(name, settings, &mut registry)?;
            tracing::debug!(
                location = %name,
                enabled = location.enabled,
                domain = %location.domain,
                "compiled location"
            );
            locations.insert(name.clone(), Arc::new(location));
        }

        Ok(CompiledConfig {
            registry,
            locations,
            arena_size: self.arena_size,
            accounting_queue: self.accounting_queue.max(1),
            resync_on_start: self.resync_on_start,
        })
    }
}

fn builtin_defaults() -> LocationSettings {
    LocationSettings {
        enabled: Some(false),
        server: Some(DEFAULT_SERVER.to_string()),
        domain: Some(DEFAULT_DOMAIN.to_string()),
        identifier: Some(DEFAULT_IDENTIFIER.to_string()),
        log_info: Some(String::new()),
        max_delay: Some(DEFAULT_MAX_DELAY),
        reject_status: Some(DEFAULT_REJECT_STATUS),
    }
}

fn resolve(
    name: &str,
    settings: LocationSettings,
    registry: &mut MasterRegistry,
) -> Result<LocationConfig, ConfigError> {
    // Every field is set once merged over the built-in defaults.
    let enabled = settings.enabled.unwrap_or(false);
    let server = settings.server.unwrap_or_default();
    let domain = settings.domain.unwrap_or_default();
    let code = settings.reject_status.unwrap_or(DEFAULT_REJECT_STATUS);

    if domain.is_empty() || domain.contains('\0') {
        return Err(ConfigError::Domain(domain));
    }
    if !(400..=599).contains(&code) {
        return Err(ConfigError::Status(code));
    }
    let reject_status = StatusCode::from_u16(code).map_err(|_| ConfigError::Status(code))?;
    let identifier = Expression::parse(settings.identifier.as_deref().unwrap_or_default())?;
    let log_info = Expression::parse(settings.log_info.as_deref().unwrap_or_default())?;

    let master = if enabled {
        Some(registry.register(&server, &domain)?)
    } else {
        crate::registry::GovernorAddress::parse(&server)?;
        None
    };

    Ok(LocationConfig {
        name: name.to_string(),
        enabled,
        master,
        domain,
        identifier,
        log_info,
        max_delay: settings.max_delay.unwrap_or(DEFAULT_MAX_DELAY),
        reject_status,
    })
}

/// Parses a byte size: `4194304`, `512k`, `4m` or `1g`.
pub fn parse_size(raw: &str) -> Result<usize, ConfigError> {
    let fail = || ConfigError::Size(raw.to_string());
    let text = raw.trim();
    let (digits, shift) = match text.char_indices().last() {
        Some((at, 'k' | 'K')) => (&text[..at], 10),
        Some((at, 'm' | 'M')) => (&text[..at], 20),
        Some((at, 'g' | 'G')) => (&text[..at], 30),
        _ => (text, 0),
    };
    let value = digits.trim().parse::<usize>().map_err(|_| fail())?;
    value.checked_mul(1usize << shift).ok_or_else(fail)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Size {
    Bytes(usize),
    Text(String),
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    match Size::deserialize(deserializer)? {
        Size::Bytes(bytes) => Ok(bytes),
        Size::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Delay {
    Millis(u64),
    Text(String),
}

fn deserialize_delay<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Delay::deserialize(deserializer)? {
        Delay::Millis(ms) => Ok(Some(Duration::from_millis(ms))),
        Delay::Text(text) => humantime::parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
