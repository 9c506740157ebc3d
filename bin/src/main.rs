#[macro_use]
extern crate log;

mod cli;

use clap::Parser;

use burrow_command::{
    config::ConfigError,
    logging::{setup_logging, LogError},
};
use burrow_lib::{Server, ServerError};

#[derive(thiserror::Error, Debug)]
enum MainError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("could not set up logging: {0}")]
    Logging(#[from] LogError),
    #[error("could not start the proxy: {0}")]
    Start(ServerError),
    #[error("the proxy failed: {0}")]
    Run(ServerError),
}

fn main() {
    if let Err(error) = run() {
        // the logger may not be set up yet
        eprintln!("burrow: {error}");
        error!("{}", error);
        std::process::exit(1);
    }
}

fn run() -> Result<(), MainError> {
    let args = cli::Args::parse();
    let config = args.to_config()?;

    setup_logging(&config.log_target, &config.log_level, "BURROW")?;
    info!(
        "starting burrow {} on {}:{}, resolver: {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_host,
        config.listen_port,
        config.resolver.mode
    );

    let server = Server::start(config).map_err(MainError::Start)?;
    server.run().map_err(MainError::Run)
}
