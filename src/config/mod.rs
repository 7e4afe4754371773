mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    LoggingSettings, PartialSettings, ResourceKind, ResourceSettings, ServerSettings, Settings,
    StorageSettings, TransmissionSettings,
};

/// Prefix of environment overrides, e.g. `FOGCOAP_SERVER__PORT=5684`.
pub const ENV_PREFIX: &str = "FOGCOAP";

/// Loads the configuration from `config/default` (if present), a `.env` file
/// and `FOGCOAP_*` environment variables, merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load("config/default", false)
}

/// Like [`load_config`] but reads the given file, which must exist.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    load(path, true)
}

fn load(file: &str, required: bool) -> Result<Settings, ConfigError> {
    // A missing .env file is the normal case.
    let _ = dotenvy::dotenv();

    let config = Config::builder()
        .add_source(File::with_name(file).required(required))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    let settings = partial.merge(Settings::default());
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let transmission = &settings.transmission;
    if transmission.ack_random_factor < 1.0 {
        return Err(ConfigError::Message(format!(
            "transmission.ack_random_factor must be at least 1.0, got {}",
            transmission.ack_random_factor
        )));
    }
    if transmission.ack_timeout_ms == 0 {
        return Err(ConfigError::Message(
            "transmission.ack_timeout_ms must be positive".to_string(),
        ));
    }
    if transmission.tick_interval_ms == 0 {
        return Err(ConfigError::Message(
            "transmission.tick_interval_ms must be positive".to_string(),
        ));
    }
    if transmission.max_dedup_entries == 0 {
        return Err(ConfigError::Message(
            "transmission.max_dedup_entries must be positive".to_string(),
        ));
    }
    Ok(())
}
