use std::{
    env, fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use super::DEFAULT_BIND_ADDR;

pub const DEFAULT_CONFIG_FILE: &str = "customers.toml";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://customers.db?mode=rwc";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.trim() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration: defaults, then the optional TOML file, then environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub database_max_connections: u32,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

/// Where to look for the config file.
///
/// An explicit `config_path` (usually `--config`) wins over `CONFIG_PATH`. When
/// neither is set, [`DEFAULT_CONFIG_FILE`] is read if it exists in the working directory.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let patch = match resolve_config_path(options.config_path)? {
            Some(path) => read_patch(&path)?,
            None => ConfigPatch::default(),
        };
        Self::resolve(patch)
    }

    fn resolve(patch: ConfigPatch) -> Result<Self, ConfigError> {
        let server = patch.server.unwrap_or_default();
        let database = patch.database.unwrap_or_default();

        let environment = read_env("APP_ENV")
            .or(patch.environment)
            .unwrap_or_else(|| "development".to_string());
        let environment = Environment::from_str(&environment)?;

        let bind_addr = read_env("APP_BIND_ADDR")
            .or(server.bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .trim()
            .parse()
            .map_err(ConfigError::BindAddress)?;

        let database_url = read_env("DATABASE_URL")
            .or(database.url)
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let database_max_connections = match read_env("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(value) => value,
                Err(_) => return Err(ConfigError::MaxConnections(raw)),
            },
            None => database
                .max_connections
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
        };
        if database_max_connections == 0 {
            return Err(ConfigError::MaxConnections("0".to_string()));
        }

        let request_timeout = timeout_secs(
            "APP_REQUEST_TIMEOUT_SECS",
            server.request_timeout_secs,
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        let shutdown_timeout = timeout_secs(
            "APP_SHUTDOWN_TIMEOUT_SECS",
            server.shutdown_timeout_secs,
            DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        )?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            database_max_connections,
            request_timeout,
            shutdown_timeout,
        })
    }
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<Option<PathBuf>, ConfigError> {
    match explicit.or_else(|| read_env("CONFIG_PATH").map(PathBuf::from)) {
        Some(path) if path.exists() => Ok(Some(path)),
        Some(path) => Err(ConfigError::MissingFile(path)),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            Ok(fallback.exists().then_some(fallback))
        }
    }
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source,
    })
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn timeout_secs(
    key: &'static str,
    from_file: Option<u64>,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = match read_env(key) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(value) => value,
            Err(_) => return Err(ConfigError::Timeout { key, value: raw }),
        },
        None => from_file.unwrap_or(default),
    };
    if secs == 0 {
        return Err(ConfigError::Timeout {
            key,
            value: "0".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    environment: Option<String>,
    server: Option<ServerPatch>,
    database: Option<DatabasePatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_addr: Option<String>,
    request_timeout_secs: Option<u64>,
    shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MaxConnections(String),
    Timeout { key: &'static str, value: String },
    MissingFile(PathBuf),
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid bind address: {err}"),
            Self::MaxConnections(value) => write!(
                f,
                "database max connections must be a positive integer (got {value})"
            ),
            Self::Timeout { key, value } => {
                write!(f, "{key} must be a positive number of seconds (got {value})")
            }
            Self::MissingFile(path) => {
                write!(f, "config file `{}` does not exist", path.display())
            }
            Self::ReadFile { path, source } => {
                write!(f, "could not read config file `{}`: {source}", path.display())
            }
            Self::ParseFile { path, source } => {
                write!(f, "could not parse config file `{}`: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindAddress(err) => Some(err),
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseFile { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ENV_GUARD;
    use tempfile::TempDir;

    const ENV_KEYS: [&str; 7] = [
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "APP_REQUEST_TIMEOUT_SECS",
        "APP_SHUTDOWN_TIMEOUT_SECS",
        "CONFIG_PATH",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("customers.toml");
        fs::write(&path, contents).expect("write config file");
        path
    }

    fn load_from(path: PathBuf) -> Result<AppConfig, ConfigError> {
        AppConfig::load(LoadOptions {
            config_path: Some(path),
        })
    }

    const FULL_FILE: &str = r#"
environment = "production"

[server]
bind_addr = "0.0.0.0:9000"
request_timeout_secs = 12
shutdown_timeout_secs = 3

[database]
url = "sqlite:///var/lib/customers.db"
max_connections = 12
"#;

    #[test]
    fn loads_defaults_without_file_or_env() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::load(LoadOptions::default()).expect("defaults should load");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(
            config.database_max_connections,
            DEFAULT_DATABASE_MAX_CONNECTIONS
        );
        assert_eq!(
            config.request_timeout,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        );
        assert_eq!(
            config.shutdown_timeout,
            Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
        );
    }

    #[test]
    fn reads_every_value_from_file() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        let dir = TempDir::new().expect("tempdir");

        let config = load_from(write_config(&dir, FULL_FILE)).expect("file should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.database_url, "sqlite:///var/lib/customers.db");
        assert_eq!(config.database_max_connections, 12);
        assert_eq!(config.request_timeout, Duration::from_secs(12));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
    }

    #[test]
    fn environment_overrides_file_values() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(&dir, FULL_FILE);
        env::set_var("APP_BIND_ADDR", "127.0.0.1:7000");
        env::set_var("DATABASE_URL", "sqlite://from-env.db");
        env::set_var("APP_SHUTDOWN_TIMEOUT_SECS", "9");

        let result = load_from(path);
        clear_env();

        let config = result.expect("config should load");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7000");
        assert_eq!(config.database_url, "sqlite://from-env.db");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(9));
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.database_max_connections, 12);
        assert_eq!(config.request_timeout, Duration::from_secs(12));
    }

    #[test]
    fn config_path_variable_selects_file() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(&dir, "[database]\nmax_connections = 2\n");
        env::set_var("CONFIG_PATH", &path);

        let result = AppConfig::load(LoadOptions::default());
        clear_env();

        assert_eq!(result.expect("config should load").database_max_connections, 2);
    }

    #[test]
    fn missing_requested_file_is_an_error() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("absent.toml");

        let err = load_from(path.clone()).expect_err("missing file should error");
        assert!(matches!(err, ConfigError::MissingFile(missing) if missing == path));

        env::set_var("CONFIG_PATH", &path);
        let result = AppConfig::load(LoadOptions::default());
        clear_env();
        assert!(matches!(result, Err(ConfigError::MissingFile(_))));
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        let dir = TempDir::new().expect("tempdir");

        let err = load_from(write_config(&dir, "[database]\nmax_connections = \"many\"\n"))
            .expect_err("wrong type should error");
        assert!(matches!(err, ConfigError::ParseFile { .. }));
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let result = AppConfig::load(LoadOptions::default());
        clear_env();

        let err = result.expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));
    }

    #[test]
    fn rejects_malformed_bind_address() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_BIND_ADDR", "not-an-address");

        let result = AppConfig::load(LoadOptions::default());
        clear_env();

        assert!(matches!(result, Err(ConfigError::BindAddress(_))));
    }

    #[test]
    fn rejects_zero_max_connections() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("DATABASE_MAX_CONNECTIONS", "0");

        let result = AppConfig::load(LoadOptions::default());
        clear_env();

        let err = result.expect_err("zero connections should error");
        assert!(matches!(err, ConfigError::MaxConnections(value) if value == "0"));
    }

    #[test]
    fn rejects_zero_timeout_from_file() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        let dir = TempDir::new().expect("tempdir");

        let err = load_from(write_config(&dir, "[server]\nshutdown_timeout_secs = 0\n"))
            .expect_err("zero timeout should error");
        assert!(matches!(
            err,
            ConfigError::Timeout { key: "APP_SHUTDOWN_TIMEOUT_SECS", .. }
        ));
    }
}
