//! Server launcher

use std::process::ExitCode;

use clap::{ArgMatches, Command};

use crate::config::ConfigType;

/// Defines command line options
pub fn define_command_line_options(app: Command) -> Command {
    super::define_common_options(app)
}

/// Program entrance `main`
pub fn main(matches: &ArgMatches) -> ExitCode {
    super::main(matches, ConfigType::Server, "fsserver")
}
