use serde::Deserialize;

/// Top-level configuration settings for the broker process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub transmission: TransmissionSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub resources: Vec<ResourceSettings>,
}

/// Where the datagram transport binds, and whether resource discovery is served.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub well_known_core: bool,
    /// Observe registrations kept at once; beyond this, GET is served without Observe.
    pub max_observers: usize,
}

/// Reliability layer constants. Defaults are the RFC 7252 transmission parameters.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TransmissionSettings {
    pub ack_timeout_ms: u64,
    pub ack_random_factor: f64,
    pub max_retransmit: u8,
    /// Dedup window, and how long an acknowledged request waits for its separate response.
    pub exchange_lifetime_secs: u64,
    pub non_lifetime_secs: u64,
    pub tick_interval_ms: u64,
    /// Received messages remembered for deduplication. The oldest is evicted first.
    pub max_dedup_entries: usize,
}

/// Connection parameters for the storage adapter.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    pub path: String,
    pub database: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// A resource registered when the broker starts.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ResourceSettings {
    pub path: String,
    pub methods: Vec<String>,
    #[serde(default)]
    pub kind: ResourceKind,
    pub content_format: Option<u16>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[default]
    Stored,
    Collection,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every value is optional; missing values are filled from [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub transmission: Option<PartialTransmissionSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub resources: Option<Vec<ResourceSettings>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub well_known_core: Option<bool>,
    pub max_observers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTransmissionSettings {
    pub ack_timeout_ms: Option<u64>,
    pub ack_random_factor: Option<f64>,
    pub max_retransmit: Option<u8>,
    pub exchange_lifetime_secs: Option<u64>,
    pub non_lifetime_secs: Option<u64>,
    pub tick_interval_ms: Option<u64>,
    pub max_dedup_entries: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub database: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 5683,
                well_known_core: true,
                max_observers: 256,
            },
            transmission: TransmissionSettings {
                ack_timeout_ms: 2000,
                ack_random_factor: 1.5,
                max_retransmit: 4,
                exchange_lifetime_secs: 247,
                non_lifetime_secs: 145,
                tick_interval_ms: 100,
                max_dedup_entries: 4096,
            },
            storage: StorageSettings {
                path: "fogcoap_db".to_string(),
                database: "fogcoap".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            resources: Vec::new(),
        }
    }
}

impl PartialSettings {
    /// Overlay the values present here on top of `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let transmission = self.transmission.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
                well_known_core: server
                    .well_known_core
                    .unwrap_or(defaults.server.well_known_core),
                max_observers: server.max_observers.unwrap_or(defaults.server.max_observers),
            },
            transmission: TransmissionSettings {
                ack_timeout_ms: transmission
                    .ack_timeout_ms
                    .unwrap_or(defaults.transmission.ack_timeout_ms),
                ack_random_factor: transmission
                    .ack_random_factor
                    .unwrap_or(defaults.transmission.ack_random_factor),
                max_retransmit: transmission
                    .max_retransmit
                    .unwrap_or(defaults.transmission.max_retransmit),
                exchange_lifetime_secs: transmission
                    .exchange_lifetime_secs
                    .unwrap_or(defaults.transmission.exchange_lifetime_secs),
                non_lifetime_secs: transmission
                    .non_lifetime_secs
                    .unwrap_or(defaults.transmission.non_lifetime_secs),
                tick_interval_ms: transmission
                    .tick_interval_ms
                    .unwrap_or(defaults.transmission.tick_interval_ms),
                max_dedup_entries: transmission
                    .max_dedup_entries
                    .unwrap_or(defaults.transmission.max_dedup_entries),
            },
            storage: StorageSettings {
                path: storage.path.unwrap_or(defaults.storage.path),
                database: storage.database.unwrap_or(defaults.storage.database),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
            resources: self.resources.unwrap_or(defaults.resources),
        }
    }
}
