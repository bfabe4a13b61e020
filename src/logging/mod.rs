//! Logging facilities with log4rs

use std::{
    io::{self, ErrorKind},
    path::Path,
};

use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
};

use crate::config::LogConfig;

fn logging_error<E: ToString>(err: E) -> io::Error {
    io::Error::new(ErrorKind::Other, err.to_string())
}

/// Initialize logger ([log4rs](https://crates.io/crates/log4rs)) from yaml configuration file
pub fn init_with_file<P>(path: P) -> io::Result<()>
where
    P: AsRef<Path>,
{
    log4rs::init_file(path, Default::default()).map_err(logging_error)
}

/// Initialize logger with provided configuration
pub fn init_with_config(bin_name: &str, config: &LogConfig) -> io::Result<()> {
    if let Some(ref path) = config.config_path {
        return init_with_file(path);
    }

    let debug_level = config.level;

    let mut pattern = String::new();
    if !config.without_time {
        pattern += "{d} ";
    }
    pattern += "{h({l}):<5} ";
    if debug_level >= 1 {
        pattern += "[{P}:{I}] [{M}] ";
    }
    pattern += "{m}{n}";

    let logging_builder = Config::builder().appender(
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

    let (l1, l2) = match debug_level {
        0 => (LevelFilter::Info, LevelFilter::Off),
        1 => (LevelFilter::Debug, LevelFilter::Off),
        2 => (LevelFilter::Trace, LevelFilter::Off),
        3 => (LevelFilter::Trace, LevelFilter::Debug),
        _ => (LevelFilter::Off, LevelFilter::Trace),
    };

    let config = match debug_level {
        0..=3 => logging_builder
            .logger(Logger::builder().build(bin_name, l1))
            .logger(Logger::builder().build("fssocks", l1)),
        _ => logging_builder,
    }
    .build(Root::builder().appender("console").build(l2))
    .map_err(logging_error)?;

    log4rs::init_config(config).map(|_| ()).map_err(logging_error)
}
