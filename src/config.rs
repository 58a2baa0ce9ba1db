use crate::connection::RetryPolicy;
use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Connection settings. Loaded from built-in defaults, then an optional config file, then
/// SQLCONN_* environment variables, with nested keys separated by a double underscore
/// (e.g. SQLCONN_RETRY__MAX_ATTEMPTS).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub autocommit: bool,
    pub read_only: bool,
    pub retry_aborts_internally: bool,
    /// Per backend call timeout, 0 disables it.
    pub statement_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            autocommit: true,
            read_only: false,
            retry_aborts_internally: true,
            statement_timeout_ms: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn load(file: Option<&str>) -> Result<Self> {
        let config: Self = load("SQLCONN", file, &Self::default())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        match self.statement_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Settings of the sqlconnd server. Environment variables use the SQLCONND prefix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: "127.0.0.1:9705".into(), log_level: "info".into() }
    }
}

impl ServerConfig {
    pub fn load(file: Option<&str>) -> Result<Self> {
        let config: Self = load("SQLCONND", file, &Self::default())?;
        config.listen_addr()?;
        config.log_filter()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        Ok(self.listen.parse()?)
    }

    pub fn log_filter(&self) -> Result<log::LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| Error::Config(format!("Invalid log level {}", self.log_level)))
    }
}

fn load<T>(prefix: &str, file: Option<&str>, defaults: &T) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut builder = config::Config::builder().add_source(config::Config::try_from(defaults)?);
    if let Some(file) = file {
        builder = builder.add_source(config::File::with_name(file));
    }
    Ok(builder
        .add_source(config::Environment::with_prefix(prefix).separator("__").try_parsing(true))
        .build()?
        .try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempdir::TempDir;

    #[test]
    fn defaults() -> Result<()> {
        let config = ConnectionConfig::default();
        assert!(config.autocommit);
        assert!(config.retry_aborts_internally);
        assert_eq!(None, config.statement_timeout());
        assert_eq!(Ok(()), config.validate());

        let server = ServerConfig::default();
        assert_eq!(9705, server.listen_addr()?.port());
        assert_eq!(log::LevelFilter::Info, server.log_filter()?);
        Ok(())
    }

    #[test]
    fn file() -> Result<()> {
        let dir = TempDir::new("sqlconn")?;
        let path = dir.path().join("connection.toml");
        fs::write(
            &path,
            "autocommit = false\nstatement_timeout_ms = 250\n\n[retry]\nmax_attempts = 3\n",
        )?;
        let config = ConnectionConfig::load(path.to_str())?;
        assert!(!config.autocommit);
        assert!(!config.read_only);
        assert_eq!(Some(Duration::from_millis(250)), config.statement_timeout());
        assert_eq!(3, config.retry.max_attempts);
        assert_eq!(RetryPolicy::default().base_delay_ms, config.retry.base_delay_ms);

        fs::write(&path, "[retry]\nmax_attempts = 0\n")?;
        assert!(matches!(ConnectionConfig::load(path.to_str()), Err(Error::Config(_))));

        let path = dir.path().join("server.toml");
        fs::write(&path, "listen = \"not an address\"\n")?;
        assert!(matches!(ServerConfig::load(path.to_str()), Err(Error::Config(_))));
        Ok(())
    }
}
