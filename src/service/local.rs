//! Local (client role) launcher

use std::process::ExitCode;

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::config::ConfigType;

/// Defines command line options
pub fn define_command_line_options(app: Command) -> Command {
    super::define_common_options(app)
        .arg(
            Arg::new("LOCAL_ADDR")
                .short('b')
                .long("local-addr")
                .num_args(1)
                .action(ArgAction::Set)
                .help("Local address, listen only to this address if specified"),
        )
        .arg(
            Arg::new("LOCAL_PORT")
                .short('l')
                .long("local-port")
                .num_args(1)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u16))
                .help("Local port"),
        )
}

/// Program entrance `main`
pub fn main(matches: &ArgMatches) -> ExitCode {
    super::main(matches, ConfigType::Local, "fslocal")
}
