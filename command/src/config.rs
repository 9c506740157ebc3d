//! # Configuration of the proxy
//!
//! Configuration is read from an optional TOML file into a [`FileConfig`],
//! where every key is optional, then turned into a [`Config`] where every
//! value is known and validated:
//!
//! ```toml
//! listen_host = "127.0.0.1"
//! listen_port = 5395
//! workers = 4
//! buffer_size = 8192
//!
//! [resolver]
//! mode = "doh"
//! doh_provider = "cloudflare"
//! cache_ttl_seconds = 600
//!
//! [resolver.hosts]
//! "intranet.local" = ["10.0.0.12"]
//! ```
//!
//! Command line flags are applied on top of the file by the binary.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::Read,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 5395;

/// size of the per client buffer, which also bounds the request header
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const MIN_BUFFER_SIZE: usize = 512;
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// number of client records each worker preallocates
pub const DEFAULT_SLAB_CAPACITY: usize = 32;

pub const DEFAULT_MAX_EVENTS: usize = 32;
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_LINGER_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_WORKER_START_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RESOLVER_THREADS: usize = 2;
pub const DEFAULT_HOST_CACHE_CAPACITY: usize = 128;
pub const DEFAULT_HOST_CACHE_TTL: Duration = Duration::from_secs(1200);
pub const MAX_HOST_NAME_LEN: usize = 255;

/// upper bound of consecutive buffer transfers in one relay pass
pub const MAX_LOOP_ITERATIONS: usize = 16;

pub const DOH_ADGUARD: &str = "https://dns.adguard-dns.com/resolve";
pub const DOH_CLOUDFLARE: &str = "https://cloudflare-dns.com/dns-query";
pub const DOH_GOOGLE: &str = "https://dns.google/resolve";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not open configuration file {0}: {1}")]
    FileOpen(String, std::io::Error),
    #[error("could not read configuration file {0}: {1}")]
    FileRead(String, std::io::Error),
    #[error("could not parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("invalid listen address {0}")]
    InvalidAddress(String),
    #[error("unknown resolver mode {0}, expected system or doh")]
    UnknownResolverMode(String),
    #[error("unknown DNS-over-HTTPS provider {0}, expected adguard, cloudflare or google")]
    UnknownDohProvider(String),
}

/// How target host names are turned into addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    /// the platform resolver
    System,
    /// DNS-over-HTTPS, JSON flavour
    #[default]
    Doh,
}

impl FromStr for ResolverMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" | "default" => Ok(ResolverMode::System),
            "doh" => Ok(ResolverMode::Doh),
            _ => Err(ConfigError::UnknownResolverMode(s.to_owned())),
        }
    }
}

impl fmt::Display for ResolverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverMode::System => write!(f, "system"),
            ResolverMode::Doh => write!(f, "doh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DohProvider {
    Adguard,
    Cloudflare,
    Google,
}

impl DohProvider {
    pub fn url(&self) -> &'static str {
        match self {
            DohProvider::Adguard => DOH_ADGUARD,
            DohProvider::Cloudflare => DOH_CLOUDFLARE,
            DohProvider::Google => DOH_GOOGLE,
        }
    }
}

impl FromStr for DohProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adguard" => Ok(DohProvider::Adguard),
            "cloudflare" => Ok(DohProvider::Cloudflare),
            "google" => Ok(DohProvider::Google),
            _ => Err(ConfigError::UnknownDohProvider(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    pub mode: ResolverMode,
    pub doh_url: String,
    pub timeout: Duration,
    pub threads: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// answered without any lookup, like an `/etc/hosts` file
    pub hosts: BTreeMap<String, Vec<IpAddr>>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            mode: ResolverMode::default(),
            doh_url: DOH_ADGUARD.to_owned(),
            timeout: DEFAULT_RESOLVER_TIMEOUT,
            threads: DEFAULT_RESOLVER_THREADS,
            cache_capacity: DEFAULT_HOST_CACHE_CAPACITY,
            cache_ttl: DEFAULT_HOST_CACHE_TTL,
            hosts: BTreeMap::new(),
        }
    }
}

/// Resolved configuration, every value is known and valid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    /// 0 means one worker per available processor
    pub workers: usize,
    pub buffer_size: usize,
    pub slab_capacity: usize,
    /// 0 means unbounded
    pub max_clients_per_worker: usize,
    pub max_events: usize,
    pub event_timeout: Duration,
    pub linger_timeout: Duration,
    pub worker_start_timeout: Duration,
    pub resolver: ResolverConfig,
    pub log_level: String,
    pub log_target: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_host: DEFAULT_LISTEN_HOST.to_owned(),
            listen_port: DEFAULT_LISTEN_PORT,
            workers: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            slab_capacity: DEFAULT_SLAB_CAPACITY,
            max_clients_per_worker: 0,
            max_events: DEFAULT_MAX_EVENTS,
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            linger_timeout: DEFAULT_LINGER_TIMEOUT,
            worker_start_timeout: DEFAULT_WORKER_START_TIMEOUT,
            resolver: ResolverConfig::default(),
            log_level: "info".to_owned(),
            log_target: "stdout".to_owned(),
        }
    }
}

impl Config {
    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        let host = self
            .listen_host
            .trim_start_matches('[')
            .trim_end_matches(']');
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidAddress(self.listen_host.clone()))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Checks the invariants the engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address()?;

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::InvalidValue {
                field: "buffer_size",
                reason: format!(
                    "{} is outside of [{MIN_BUFFER_SIZE}, {MAX_BUFFER_SIZE}]",
                    self.buffer_size
                ),
            });
        }
        if self.max_events == 0 {
            return Err(invalid("max_events", "must be at least 1"));
        }
        if self.event_timeout.is_zero() {
            return Err(invalid("event_timeout_ms", "must be at least 1ms"));
        }
        if self.worker_start_timeout.is_zero() {
            return Err(invalid("worker_start_timeout_ms", "must be at least 1ms"));
        }
        if self.resolver.threads == 0 {
            return Err(invalid("resolver.threads", "must be at least 1"));
        }
        if self.resolver.cache_capacity == 0 {
            return Err(invalid("resolver.cache_capacity", "must be at least 1"));
        }
        if self.resolver.mode == ResolverMode::Doh && !is_doh_url(&self.resolver.doh_url) {
            return Err(ConfigError::InvalidValue {
                field: "resolver.doh_url",
                reason: format!("{} is not an https:// URL", self.resolver.doh_url),
            });
        }
        for (host, addresses) in &self.resolver.hosts {
            if host.is_empty() || host.len() > MAX_HOST_NAME_LEN {
                return Err(ConfigError::InvalidValue {
                    field: "resolver.hosts",
                    reason: format!("invalid host name {host:?}"),
                });
            }
            if addresses.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "resolver.hosts",
                    reason: format!("no address for {host}"),
                });
            }
        }
        Ok(())
    }
}

/// plain http is only accepted for a resolver on the loopback
fn is_doh_url(url: &str) -> bool {
    if url.starts_with("https://") {
        return true;
    }
    let Some(rest) = url.strip_prefix("http://") else {
        return false;
    };
    let authority = rest.split('/').next().unwrap_or_default();
    let host = match authority.strip_prefix('[') {
        Some(bracketed) => bracketed.split(']').next().unwrap_or_default(),
        None => authority.split(':').next().unwrap_or_default(),
    };
    host == "localhost"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_owned(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileResolverConfig {
    pub mode: Option<ResolverMode>,
    pub doh_provider: Option<DohProvider>,
    pub doh_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub threads: Option<usize>,
    pub cache_capacity: Option<usize>,
    pub cache_ttl_seconds: Option<u64>,
    pub hosts: Option<BTreeMap<String, Vec<IpAddr>>>,
}

/// Configuration as written in the file, every key is optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub workers: Option<usize>,
    pub buffer_size: Option<usize>,
    pub slab_capacity: Option<usize>,
    pub max_clients_per_worker: Option<usize>,
    pub max_events: Option<usize>,
    pub event_timeout_ms: Option<u64>,
    pub linger_timeout_ms: Option<u64>,
    pub worker_start_timeout_ms: Option<u64>,
    pub log_level: Option<String>,
    pub log_target: Option<String>,
    pub resolver: Option<FileResolverConfig>,
}

impl FileConfig {
    pub fn load_from_path(path: &str) -> Result<FileConfig, ConfigError> {
        let mut file =
            File::open(path).map_err(|io_error| ConfigError::FileOpen(path.to_owned(), io_error))?;

        let mut data = String::new();
        file.read_to_string(&mut data)
            .map_err(|io_error| ConfigError::FileRead(path.to_owned(), io_error))?;

        FileConfig::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<FileConfig, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    /// Fills the gaps with defaults and validates the result
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let defaults = Config::default();
        let file_resolver = self.resolver.unwrap_or_default();

        let doh_url = match (file_resolver.doh_url, file_resolver.doh_provider) {
            (Some(url), _) => url,
            (None, Some(provider)) => provider.url().to_owned(),
            (None, None) => defaults.resolver.doh_url.clone(),
        };

        let resolver = ResolverConfig {
            mode: file_resolver.mode.unwrap_or(defaults.resolver.mode),
            doh_url,
            timeout: file_resolver
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.resolver.timeout),
            threads: file_resolver.threads.unwrap_or(defaults.resolver.threads),
            cache_capacity: file_resolver
                .cache_capacity
                .unwrap_or(defaults.resolver.cache_capacity),
            cache_ttl: file_resolver
                .cache_ttl_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.resolver.cache_ttl),
            hosts: file_resolver.hosts.unwrap_or_default(),
        };

        let config = Config {
            listen_host: self.listen_host.unwrap_or(defaults.listen_host),
            listen_port: self.listen_port.unwrap_or(defaults.listen_port),
            workers: self.workers.unwrap_or(defaults.workers),
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size),
            slab_capacity: self.slab_capacity.unwrap_or(defaults.slab_capacity),
            max_clients_per_worker: self
                .max_clients_per_worker
                .unwrap_or(defaults.max_clients_per_worker),
            max_events: self.max_events.unwrap_or(defaults.max_events),
            event_timeout: self
                .event_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.event_timeout),
            linger_timeout: self
                .linger_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.linger_timeout),
            worker_start_timeout: self
                .worker_start_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.worker_start_timeout),
            resolver,
            log_level: self.log_level.unwrap_or(defaults.log_level),
            log_target: self.log_target.unwrap_or(defaults.log_target),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = FileConfig::from_toml_str("")
            .and_then(FileConfig::into_config)
            .expect("empty configuration should be valid");
        assert_eq!(config, Config::default());
        assert_eq!(
            config.listen_address().unwrap(),
            "127.0.0.1:5395".parse().unwrap()
        );
    }

    #[test]
    fn parse_full_file() {
        let data = r#"
            listen_host = "0.0.0.0"
            listen_port = 3128
            workers = 3
            buffer_size = 4096
            event_timeout_ms = 250

            [resolver]
            mode = "doh"
            doh_provider = "google"
            cache_ttl_seconds = 60

            [resolver.hosts]
            "intranet.local" = ["10.0.0.12", "::1"]
        "#;

        let config = FileConfig::from_toml_str(data)
            .and_then(FileConfig::into_config)
            .expect("could not parse configuration");

        assert_eq!(config.listen_port, 3128);
        assert_eq!(config.workers, 3);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.event_timeout, Duration::from_millis(250));
        assert_eq!(config.resolver.doh_url, DOH_GOOGLE);
        assert_eq!(config.resolver.cache_ttl, Duration::from_secs(60));
        assert_eq!(
            config.resolver.hosts.get("intranet.local"),
            Some(&vec![
                "10.0.0.12".parse::<IpAddr>().unwrap(),
                "::1".parse::<IpAddr>().unwrap()
            ])
        );
    }

    #[test]
    fn explicit_doh_url_wins_over_provider() {
        let data = r#"
            [resolver]
            doh_provider = "google"
            doh_url = "https://doh.example.net/resolve"
        "#;
        let config = FileConfig::from_toml_str(data)
            .and_then(FileConfig::into_config)
            .unwrap();
        assert_eq!(config.resolver.doh_url, "https://doh.example.net/resolve");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            FileConfig::from_toml_str("listen_hots = \"127.0.0.1\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tiny_buffer = FileConfig {
            buffer_size: Some(16),
            ..Default::default()
        };
        assert!(matches!(
            tiny_buffer.into_config(),
            Err(ConfigError::InvalidValue {
                field: "buffer_size",
                ..
            })
        ));

        let bad_host = FileConfig {
            listen_host: Some("localhost".to_owned()),
            ..Default::default()
        };
        assert!(matches!(
            bad_host.into_config(),
            Err(ConfigError::InvalidAddress(_))
        ));

        let plain_http_doh = FileConfig {
            resolver: Some(FileResolverConfig {
                doh_url: Some("http://dns.example.net/resolve".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(plain_http_doh.into_config().is_err());
    }

    #[test]
    fn plain_http_doh_on_the_loopback() {
        assert!(is_doh_url("http://127.0.0.1:5353/dns-query"));
        assert!(is_doh_url("http://[::1]:8053/resolve"));
        assert!(is_doh_url("http://localhost/resolve"));
        assert!(!is_doh_url("http://10.0.0.1/resolve"));
        assert!(!is_doh_url("ftp://127.0.0.1/resolve"));
    }

    #[test]
    fn bracketed_ipv6_listen_host() {
        let config = Config {
            listen_host: "[::1]".to_owned(),
            ..Default::default()
        };
        assert_eq!(config.listen_address().unwrap(), "[::1]:5395".parse().unwrap());
    }

    #[test]
    fn resolver_mode_and_provider_from_str() {
        assert_eq!("System".parse::<ResolverMode>().unwrap(), ResolverMode::System);
        assert_eq!("doh".parse::<ResolverMode>().unwrap(), ResolverMode::Doh);
        assert!("dns".parse::<ResolverMode>().is_err());
        assert_eq!(
            "cloudflare".parse::<DohProvider>().unwrap().url(),
            DOH_CLOUDFLARE
        );
        assert!("quad9".parse::<DohProvider>().is_err());
    }
}
