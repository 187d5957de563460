#![deny(unsafe_code)]

use std::net::ToSocketAddrs;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use daemon::DaemonConfig;

/// chunkfs coordinator: metadata directory and failure detector for the
/// chunkfs file service. Stores no file data.
#[derive(Debug, Parser)]
#[command(name = "chunkfsd", version)]
struct Cli {
    /// Address to listen on, as host:port.
    listen: String,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    /// `CHUNKFSD_LOG` overrides this with an env-filter expression.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let listen = match cli.listen.to_socket_addrs().map(|mut addrs| addrs.next()) {
        Ok(Some(addr)) => addr,
        Ok(None) | Err(_) => {
            eprintln!("chunkfsd: '{}' is not a usable host:port", cli.listen);
            return ExitCode::FAILURE;
        }
    };

    match daemon::run(DaemonConfig::new(listen)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("chunkfsd: {error}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("CHUNKFSD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
