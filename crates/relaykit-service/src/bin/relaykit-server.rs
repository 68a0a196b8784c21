//! Runs the servers described by a configuration file
//!
//! The format of the configuration file is defined in mod `relaykit_service::config`.

use std::{path::PathBuf, process::ExitCode};

use clap::{Arg, ArgAction, Command, value_parser};
use futures::future::{self, Either};
use log::{info, trace};
use relaykit_service::{Config, build_runtime, logging, run};

const EXIT_CODE_LOAD_CONFIG_FAILURE: u8 = 2;
const EXIT_CODE_SERVER_EXIT_UNEXPECTEDLY: u8 = 3;
const EXIT_CODE_SERVER_ABORTED: u8 = 4;

fn main() -> ExitCode {
    let matches = Command::new("relaykit-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SOCKS5, UDP tunnel and RPC servers")
        .arg(
            Arg::new("CONFIG")
                .short('c')
                .long("config")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("JSON5 configuration file"),
        )
        .arg(
            Arg::new("VERBOSE")
                .short('v')
                .action(ArgAction::Count)
                .help("Set log level"),
        )
        .arg(
            Arg::new("LOG_WITHOUT_TIME")
                .long("log-without-time")
                .action(ArgAction::SetTrue)
                .help("Log without datetime prefix"),
        )
        .arg(
            Arg::new("LOG_CONFIG")
                .long("log-config")
                .value_parser(value_parser!(PathBuf))
                .help("log4rs configuration file"),
        )
        .get_matches();

    let logged = match matches.get_one::<PathBuf>("LOG_CONFIG") {
        Some(path) => logging::init_with_file(path),
        None => logging::init_with_config(
            "relaykit_server",
            matches.get_count("VERBOSE"),
            matches.get_flag("LOG_WITHOUT_TIME"),
        ),
    };
    if let Err(err) = logged {
        eprintln!("{}", err);
        return EXIT_CODE_LOAD_CONFIG_FAILURE.into();
    }

    let config = match matches.get_one::<PathBuf>("CONFIG") {
        Some(path) => match Config::load_from_file(path) {
            Ok(c) => c,
            Err(err) => {
                eprintln!("loading config {:?}, {}", path, err);
                return EXIT_CODE_LOAD_CONFIG_FAILURE.into();
            }
        },
        None => {
            eprintln!("missing configuration file, specify it with --config");
            return EXIT_CODE_LOAD_CONFIG_FAILURE.into();
        }
    };

    trace!("{:?}", config);

    let runtime = match build_runtime(&config) {
        Ok(r) => r,
        Err(err) => {
            eprintln!("failed to create runtime, {}", err);
            return EXIT_CODE_SERVER_ABORTED.into();
        }
    };

    runtime.block_on(async move {
        let abort_signal = tokio::signal::ctrl_c();
        let server = run(config);

        tokio::pin!(abort_signal);
        tokio::pin!(server);

        match future::select(server, abort_signal).await {
            // Servers only return when they fail
            Either::Left((Ok(..), ..)) => {
                eprintln!("server exited unexpectedly");
                EXIT_CODE_SERVER_EXIT_UNEXPECTEDLY.into()
            }
            Either::Left((Err(err), ..)) => {
                eprintln!("server aborted with {}", err);
                EXIT_CODE_SERVER_ABORTED.into()
            }
            Either::Right(..) => {
                info!("received interrupt, exiting");
                ExitCode::SUCCESS
            }
        }
    })
}
