use std::{env, net::SocketAddr, path::Path};

use clap::{Args, Parser, Subcommand};
use ldapmon::{
    agent::Agent,
    config::{self, Config, Telemetry},
    directory::ldap::LdapConnector,
    engine::Engine,
    metric_spec,
    sink::MetricsSink,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load ldapmon config: {0}")]
    Config(#[from] config::Error),
    #[error("Invalid metric specification: {0}")]
    MetricSpec(#[from] metric_spec::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "/etc/ldapmon/ldapmon.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the configured directory server until interrupted
    Run(RunCommand),
    /// Validate configuration and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file, or a directory of .yaml
    /// overlays
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// address to bind prometheus exporter to, overriding the configured
    /// telemetry
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 10)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file, or a directory of .yaml
    /// overlays
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config(config_path: &str) -> Result<Config, Error> {
    if let Ok(env_var_value) = env::var("LDAPMON_CONFIG") {
        debug!("Using config from env var 'LDAPMON_CONFIG'");
        Ok(config::parse(&env_var_value)?)
    } else {
        debug!("Attempting to load configuration from: {config_path}");
        config::load_config_from_path(Path::new(config_path)).map_err(|err| {
            error!("Could not load config '{config_path}': {err}");
            Error::from(err)
        })
    }
}

fn install_telemetry(telemetry: Telemetry) -> Result<(), Error> {
    let builder = match telemetry {
        Telemetry::PrometheusSocket {
            path,
            global_labels,
        } => global_labels
            .into_iter()
            .fold(PrometheusBuilder::new().with_http_uds_listener(path), |b, (k, v)| {
                b.add_global_label(k, v)
            }),
        Telemetry::Prometheus {
            addr,
            global_labels,
        } => global_labels
            .into_iter()
            .fold(PrometheusBuilder::new().with_http_listener(addr), |b, (k, v)| {
                b.add_global_label(k, v)
            }),
    };
    builder.install()?;
    Ok(())
}

async fn inner_main(config: Config) -> Result<(), Error> {
    // The exporter's listener is spawned onto the current runtime.
    install_telemetry(config.telemetry.clone())?;

    let engine = Engine::from_config(&config)?;
    let connector = LdapConnector::new(config.connection.clone());
    let sink = MetricsSink::new(config.agent_name());
    let agent = Agent::new(connector, engine, sink, config.sample_period());

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(err) => error!("Failed to listen for ctrl-c, shutting down: {err}"),
        }
        ctrl_c_shutdown.cancel();
    });

    info!(
        "Monitoring {name} at {url}",
        name = config.agent_name(),
        url = config.connection.url()
    );
    agent.run(shutdown).await;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting ldapmon {version}.");

    let args = match Cli::parse().command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(config_check_cmd) => {
            match load_config(&config_check_cmd.config_path) {
                Ok(_) => {
                    info!("Configuration is valid.");
                    std::process::exit(0)
                }
                Err(_) => std::process::exit(1),
            }
        }
    };

    let mut config = load_config(&args.config_path)?;
    if let Some(addr) = args.prometheus_addr {
        let global_labels = match config.telemetry {
            Telemetry::Prometheus { global_labels, .. }
            | Telemetry::PrometheusSocket { global_labels, .. } => global_labels,
        };
        config.telemetry = Telemetry::Prometheus {
            addr,
            global_labels,
        };
    }
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    info!(
        "Shutting down runtime with a {} second delay.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::parse_from(["ldapmon", "run"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.config_path, "/etc/ldapmon/ldapmon.yaml");
        assert_eq!(args.prometheus_addr, None);
        assert_eq!(args.max_shutdown_delay, 10);
    }

    #[test]
    fn config_check_takes_path() {
        let cli = Cli::parse_from(["ldapmon", "config-check", "--config-path", "/tmp/ldapmon.d"]);
        let Commands::ConfigCheck(args) = cli.command else {
            panic!("expected config-check command");
        };
        assert_eq!(args.config_path, "/tmp/ldapmon.d");
    }

    #[test]
    fn missing_config_file_fails_to_load() {
        let tmp_dir = tempfile::tempdir().expect("directory could not be created");
        let path = tmp_dir.path().join("absent.yaml");
        let path = path.to_str().expect("non utf-8 temp path");
        if env::var("LDAPMON_CONFIG").is_err() {
            assert!(matches!(load_config(path), Err(Error::Config(_))));
        }
    }
}
