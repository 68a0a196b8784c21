//! Logging facilities

use std::{io, path::Path};

use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
};

const CRATE_LOGGERS: [&str; 2] = ["relaykit", "relaykit_service"];

fn logging_error<E: ToString>(err: E) -> io::Error {
    io::Error::other(format!("logging: {}", err.to_string()))
}

/// Initializes logging from a log4rs YAML file
pub fn init_with_file<P>(path: P) -> io::Result<()>
where
    P: AsRef<Path>,
{
    log4rs::init_file(path, Default::default()).map_err(logging_error)
}

/// Initializes console logging on stderr
///
/// `verbosity` 0, 1 and 2 open `bin_name` and the relaykit crates at Info, Debug and Trace. 3 also lets other
/// crates log at Debug, anything higher logs everything.
pub fn init_with_config(bin_name: &str, verbosity: u8, without_time: bool) -> io::Result<()> {
    let mut pattern = String::new();
    if !without_time {
        pattern += "{d} ";
    }
    pattern += "{h({l}):<5} ";
    if verbosity >= 1 {
        pattern += "[{P}:{I}] [{M}] ";
    }
    pattern += "{m}{n}";

    let mut logging_builder = Config::builder().appender(
        Appender::builder().build(
            "console",
            Box::new(
                ConsoleAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(&pattern)))
                    .target(Target::Stderr)
                    .build(),
            ),
        ),
    );

    let (crate_level, root_level) = match verbosity {
        0 => (LevelFilter::Info, LevelFilter::Off),
        1 => (LevelFilter::Debug, LevelFilter::Off),
        2 => (LevelFilter::Trace, LevelFilter::Off),
        3 => (LevelFilter::Trace, LevelFilter::Debug),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };

    if root_level != LevelFilter::Trace {
        logging_builder = logging_builder.logger(Logger::builder().build(bin_name, crate_level));
        for name in CRATE_LOGGERS {
            logging_builder = logging_builder.logger(Logger::builder().build(name, crate_level));
        }
    }

    let config = logging_builder
        .build(Root::builder().appender("console").build(root_level))
        .map_err(logging_error)?;

    log4rs::init_config(config).map(|_| ()).map_err(logging_error)
}
