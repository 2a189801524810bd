use crate::config::AppConfig;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

pub struct ConfigLoader;

impl ConfigLoader {
    fn base(path: &str) -> Figment {
        // every section is `#[serde(default)]`, so missing keys fall back to defaults
        Figment::new().merge(Toml::file(path))
    }

    /// Loads configuration from a TOML file overlaid with `AUTOTRADE_` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `AUTOTRADE_MANAGER__LOCK_TTL_SECS`.
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or environment cannot be parsed.
    pub fn load(path: &str) -> Result<AppConfig> {
        let config: AppConfig = Self::base(path)
            .merge(Env::prefixed("AUTOTRADE_").split("__"))
            .extract()?;

        Ok(config)
    }

    /// Loads configuration with a profile overlay (`Config.{profile}.toml` next to `path`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(path: &str, profile: &str) -> Result<AppConfig> {
        let profile_path = match path.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem}.{profile}.{ext}"),
            None => format!("{path}.{profile}"),
        };
        let config: AppConfig = Self::base(path)
            .merge(Toml::file(profile_path))
            .merge(Env::prefixed("AUTOTRADE_").split("__"))
            .extract()?;

        Ok(config)
    }
}
