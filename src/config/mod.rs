//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, `config/default.*`
//! (optional), then `RELAYSUB__SECTION__KEY` environment variables. A `.env`
//! file in the working directory is read into the environment beforehand.

mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{BrokerSettings, LoggingSettings, ServerSettings, Settings};

pub const ENV_PREFIX: &str = "RELAYSUB";

/// Loads the configuration from the default file and environment variables,
/// merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();
    load_from("config/default")
}

/// Same as [`load_config`] with an explicit file stem and no `.env` handling.
pub fn load_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let partial: PartialSettings = builder.build()?.try_deserialize()?;
    Ok(partial.merge_into(Settings::default()))
}
