use clap::Parser;

use burrow_command::config::{
    Config, ConfigError, DohProvider, FileConfig, FileResolverConfig, ResolverMode,
};

/// A multi-worker HTTP/HTTPS forward proxy
#[derive(Parser, PartialEq, Eq, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file, command line options take precedence
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,

    /// host or address to listen on
    #[arg(long)]
    pub listen_host: Option<String>,

    /// port to listen on
    #[arg(short = 'p', long)]
    pub listen_port: Option<u16>,

    /// number of worker threads, 0 for one per processor
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// name resolution: "system" or "doh"
    #[arg(long)]
    pub resolver: Option<ResolverMode>,

    /// DNS-over-HTTPS provider: adguard, cloudflare or google
    #[arg(long, conflicts_with = "doh_url")]
    pub doh_provider: Option<DohProvider>,

    /// DNS-over-HTTPS JSON endpoint
    #[arg(long)]
    pub doh_url: Option<String>,

    /// trace, debug, info, warn, error or off
    #[arg(long)]
    pub log_level: Option<String>,

    /// stdout, stderr or file://<path>
    #[arg(long)]
    pub log_target: Option<String>,
}

impl Args {
    /// Loads the configuration file, if any, and applies the overrides
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let mut file = match &self.config {
            Some(path) => FileConfig::load_from_path(path)?,
            None => FileConfig::default(),
        };

        if let Some(host) = &self.listen_host {
            file.listen_host = Some(host.clone());
        }
        if let Some(port) = self.listen_port {
            file.listen_port = Some(port);
        }
        if let Some(workers) = self.workers {
            file.workers = Some(workers);
        }
        if let Some(level) = &self.log_level {
            file.log_level = Some(level.clone());
        }
        if let Some(target) = &self.log_target {
            file.log_target = Some(target.clone());
        }

        if self.resolver.is_some() || self.doh_provider.is_some() || self.doh_url.is_some() {
            let resolver = file.resolver.get_or_insert_with(FileResolverConfig::default);
            if let Some(mode) = self.resolver {
                resolver.mode = Some(mode);
            }
            if let Some(provider) = self.doh_provider {
                resolver.doh_provider = Some(provider);
                resolver.doh_url = None;
            }
            if let Some(url) = &self.doh_url {
                resolver.doh_url = Some(url.clone());
            }
        }

        file.into_config()
    }
}
