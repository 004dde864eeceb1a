use certissue_logging::{error, info};
use clap::Parser;
use http_adapter::{build, AdapterConfig, AdapterState};
use rocket::Config as RocketConfig;
use std::sync::Arc;
use std::time::Duration;

/// Runs the share certificate HTTP adapter.
#[derive(Parser)]
#[command(name = "http-adapter", version, about = "HTTP/JSON facade over the issuance engine")]
struct Args {
    /// Path to the adapter's JSON config file.
    config_file: String,
}

#[rocket::main]
async fn main() {
    let args = Args::parse();
    let config_file =
        std::fs::File::open(&args.config_file).expect("failed to open config file");
    let config: AdapterConfig =
        serde_json::from_reader(config_file).expect("failed to parse config file");

    let log = certissue_logging::init("http-adapter", &config.log);
    info!(log, "adapter starting";
        "listen_addr" => %config.listen_addr,
        "engine_addr" => %config.engine_addr);

    let state = Arc::new(AdapterState::new(
        config.engine_addr,
        config.pool_size,
        Duration::from_millis(config.checkout_timeout_ms),
        log.clone(),
    ));

    let rocket_config = RocketConfig {
        address: config.listen_addr.ip(),
        port: config.listen_addr.port(),
        ..RocketConfig::default()
    };

    let launch = build(state).configure(rocket_config).launch().await;

    if let Err(e) = launch {
        error!(log, "adapter exited with error"; "error" => %e);
        std::process::exit(1);
    }
}
