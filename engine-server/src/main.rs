use clap::Parser;
use engine_server::{info_startup, recover, serve, Config};
use std::fs::File;
use std::net::TcpListener;
use std::process::ExitCode;

/// Runs the certificate issuance engine.
#[derive(Parser)]
#[command(name = "engine-server", version, about = "Share certificate issuance engine")]
struct Args {
    /// Path to the engine's JSON config file.
    config_file: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config_file = File::open(&args.config_file).expect("failed to open config file");
    let config: Config = serde_json::from_reader(config_file).expect("failed to parse config file");

    let log = certissue_logging::init("engine-server", &config.log);

    let (engine, journal) = match recover(&config.classes, &config.journal_path) {
        Ok(pair) => pair,
        Err(reason) => {
            certissue_logging::error!(log, "startup recovery failed"; "reason" => reason);
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind(config.listen_addr) {
        Ok(l) => l,
        Err(e) => {
            certissue_logging::error!(log, "failed to bind listen address"; "error" => %e);
            return ExitCode::FAILURE;
        }
    };

    info_startup(&log, config.listen_addr, &config.classes);

    if let Err(e) = serve(listener, engine, journal, log.clone()) {
        certissue_logging::error!(log, "server loop exited with error"; "error" => %e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
