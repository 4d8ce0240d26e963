//! TOML configuration of a lock store
//!
//! ```toml
//! backend = "mysql"
//! table = "shared_locks"
//! quote_style = "backtick"
//!
//! [connection]
//! host = "db.internal"
//! database = "app"
//! username = "locker"
//! password = "secret"
//!
//! [tuning]
//! poll_interval_ms = 200
//! kill_retry_limit = 20
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::coordinator::{CoordinatorOptions, LockCoordinator};
use crate::registry::{schema, QuoteStyle, DEFAULT_TABLE};
use crate::store::{SqliteGateway, StoreGateway};
use crate::{Error, Result};

/// Which store holds the registry and provides the native locks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Embedded database file shared by the processes of one host
    #[default]
    Sqlite,
    /// MySQL / MariaDB server (requires the `mysql` feature)
    Mysql,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Database (schema) name; the database file path for `sqlite`
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Extra connection options appended to the URL query (`key=value&...`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            database: default_database_path().to_string_lossy().into_owned(),
            username: String::new(),
            password: String::new(),
            charset: default_charset(),
            port: None,
            options: None,
        }
    }
}

impl ConnectionConfig {
    /// Connection URL for a MySQL server
    pub fn mysql_url(&self) -> Result<String> {
        let invalid = |what: &str| Error::Config(format!("invalid connection {}", what));

        let mut url = Url::parse(&format!("mysql://{}", self.host))
            .map_err(|err| Error::Config(format!("invalid connection host {:?}: {}", self.host, err)))?;
        if !self.username.is_empty() {
            url.set_username(&self.username).map_err(|_| invalid("username"))?;
            if !self.password.is_empty() {
                url.set_password(Some(&self.password)).map_err(|_| invalid("password"))?;
            }
        }
        url.set_port(self.port).map_err(|_| invalid("port"))?;
        url.set_path(&self.database);

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("charset", &self.charset);
            if let Some(options) = &self.options {
                let options = options.trim_start_matches(['?', '&']);
                for (key, value) in url::form_urlencoded::parse(options.as_bytes()) {
                    query.append_pair(&key, &value);
                }
            }
        }
        Ok(url.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_kill_retry_limit")]
    pub kill_retry_limit: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            kill_retry_limit: default_kill_retry_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLockConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub quote_style: QuoteStyle,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub tuning: Tuning,
}

impl Default for SharedLockConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            table: default_table(),
            quote_style: QuoteStyle::default(),
            connection: ConnectionConfig::default(),
            tuning: Tuning::default(),
        }
    }
}

impl SharedLockConfig {
    pub fn validate(&self) -> Result<()> {
        schema::validate_table_name(&self.table)?;
        if self.connection.database.is_empty() {
            return Err(Error::Config("connection.database must not be empty".to_string()));
        }
        if self.tuning.poll_interval_ms == 0 {
            return Err(Error::Config("tuning.poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Open a store session for the configured backend
    pub fn connect(&self) -> Result<Box<dyn StoreGateway>> {
        self.validate()?;
        match self.backend {
            Backend::Sqlite => {
                let path = Path::new(&self.connection.database);
                ensure_db_dir(path).map_err(|err| Error::Config(err.to_string()))?;
                Ok(Box::new(SqliteGateway::open(path)?))
            }
            #[cfg(feature = "mysql")]
            Backend::Mysql => {
                let gateway = crate::store::MySqlGateway::connect(&self.connection.mysql_url()?)?;
                Ok(Box::new(gateway))
            }
            #[cfg(not(feature = "mysql"))]
            Backend::Mysql => Err(Error::Config(
                "backend \"mysql\" requires building with the `mysql` feature".to_string(),
            )),
        }
    }
}

impl LockCoordinator<Box<dyn StoreGateway>> {
    /// Connect to the configured store and build a coordinator on that session
    pub fn from_config(config: &SharedLockConfig) -> Result<Self> {
        let gateway = config.connect()?;
        LockCoordinator::new(gateway, CoordinatorOptions::from(config))
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_kill_retry_limit() -> u32 {
    20
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("sharedlock.toml")
}

pub fn default_database_path() -> PathBuf {
    PathBuf::from(".sharedlock").join("locks.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<SharedLockConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: SharedLockConfig = toml::from_str(&contents)?;
    config.validate()?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &SharedLockConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
