// ivy-probe: interactive probe for an Ivy bus.

use clap::{Arg, Command};
use probe::ProbeConfig;
use tracing::info;

fn validate_bus(value: &str) -> Result<String, String> {
    ivy_wire::decode_bus(Some(value))
        .map(|_| value.to_owned())
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("Ivy Probe")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Watch and inject messages on an Ivy bus")
        .arg(
            Arg::new("name")
                .help("Agent name to announce on the bus")
                .short('n')
                .long("name")
                .default_value("IVYPROBE"),
        )
        .arg(
            Arg::new("bus")
                .help("Bus address, e.g. 127:2010 or 224.1.2.3:2010 (default: $IVYBUS, then 127:2010)")
                .short('b')
                .long("bus")
                .value_parser(validate_bus),
        )
        .arg(
            Arg::new("regexp")
                .help("Regexps to subscribe to, e.g. '^hello (.*)'")
                .value_name("regexp")
                .num_args(0..),
        )
        .get_matches();

    let config = ProbeConfig {
        agent_name: matches.get_one::<String>("name").unwrap().clone(),
        bus: matches.get_one::<String>("bus").cloned(),
        regexps: matches
            .get_many::<String>("regexp")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
    };

    info!(version = env!("CARGO_PKG_VERSION"), agent = %config.agent_name, "ivy-probe starting");

    if let Err(e) = probe::run(config).await {
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
