//! Service launchers
//!
//! Both roles share one set of options, the binaries only differ in which role
//! they build.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode, time::Duration};

use clap::{Arg, ArgAction, ArgMatches, Command, ValueHint};
use log::{info, trace};

use crate::{
    config::{Config, ConfigType, DEFAULT_NAMESERVER},
    crypto::CipherKind,
    event_loop::MultiplexerKind,
    logging,
    vparser,
};

pub mod local;
pub mod server;

pub(crate) fn define_common_options(app: Command) -> Command {
    app.arg(
        Arg::new("CONFIG")
            .short('c')
            .long("config")
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(PathBuf))
            .value_hint(ValueHint::FilePath)
            .help("fssocks configuration file"),
    )
    .arg(
        Arg::new("SERVER_ADDR")
            .short('s')
            .long("server-addr")
            .num_args(1)
            .action(ArgAction::Set)
            .help("Server address, IP or domain name"),
    )
    .arg(
        Arg::new("SERVER_PORT")
            .short('p')
            .long("server-port")
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(u16))
            .help("Server port"),
    )
    .arg(
        Arg::new("ENCRYPT_METHOD")
            .short('m')
            .long("encrypt-method")
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(vparser::parse_cipher_kind)
            .help("Payload method, only \"none\" is available"),
    )
    .arg(
        Arg::new("DNS")
            .long("dns")
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(vparser::parse_nameservers)
            .help(format!(
                "DNS nameservers, formatted like ip[:port][,ip[:port]]..., or predefined keys like \"google\", \"cloudflare\" (default {DEFAULT_NAMESERVER})"
            )),
    )
    .arg(
        Arg::new("HOSTS_FILE")
            .long("hosts-file")
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(PathBuf))
            .value_hint(ValueHint::FilePath)
            .help("Hosts file consulted before querying nameservers"),
    )
    .arg(
        Arg::new("UDP_TIMEOUT")
            .long("udp-timeout")
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(u64))
            .help("Timeout seconds for UDP relay"),
    )
    .arg(
        Arg::new("MULTIPLEXER")
            .long("multiplexer")
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(vparser::parse_multiplexer_kind)
            .help("Readiness backend, \"mio\" (epoll / kqueue) or \"poll\""),
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
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(PathBuf))
            .value_hint(ValueHint::FilePath)
            .help("log4rs configuration file"),
    )
}

/// Build the configuration of `config_type` from a file (if any) and the command line
///
/// Command line values win over file values.
pub(crate) fn load_config(matches: &ArgMatches, config_type: ConfigType) -> Result<Config, ExitCode> {
    let mut config = match matches.get_one::<PathBuf>("CONFIG") {
        Some(config_path) => match Config::load_from_file(config_path, config_type) {
            Ok(c) => c,
            Err(err) => {
                eprintln!("loading config {config_path:?}, {err}");
                return Err(crate::EXIT_CODE_LOAD_CONFIG_FAILURE.into());
            }
        },
        None => Config::new(config_type),
    };

    if let Some(addr) = matches.get_one::<String>("SERVER_ADDR") {
        config.server_address = addr.clone();
    }
    if let Some(port) = matches.get_one::<u16>("SERVER_PORT") {
        config.server_port = *port;
    }
    // Only the local role defines these
    if let Ok(Some(addr)) = matches.try_get_one::<String>("LOCAL_ADDR") {
        config.local_address = addr.clone();
    }
    if let Ok(Some(port)) = matches.try_get_one::<u16>("LOCAL_PORT") {
        config.local_port = *port;
    }
    if let Some(method) = matches.get_one::<CipherKind>("ENCRYPT_METHOD") {
        config.method = *method;
    }
    if let Some(servers) = matches.get_one::<Vec<SocketAddr>>("DNS") {
        config.nameservers = servers.clone();
    }
    if let Some(path) = matches.get_one::<PathBuf>("HOSTS_FILE") {
        config.hosts_path = path.clone();
    }
    if let Some(timeout) = matches.get_one::<u64>("UDP_TIMEOUT") {
        config.udp_timeout = Duration::from_secs(*timeout);
    }
    if let Some(kind) = matches.get_one::<MultiplexerKind>("MULTIPLEXER") {
        config.multiplexer = *kind;
    }

    config.log.level = u32::from(matches.get_count("VERBOSE"));
    config.log.without_time = matches.get_flag("LOG_WITHOUT_TIME");
    if let Some(path) = matches.get_one::<PathBuf>("LOG_CONFIG") {
        config.log.config_path = Some(path.clone());
    }

    Ok(config)
}

/// Shared program entrance of both roles
pub(crate) fn main(matches: &ArgMatches, config_type: ConfigType, bin_name: &str) -> ExitCode {
    let config = match load_config(matches, config_type) {
        Ok(c) => c,
        Err(code) => return code,
    };

    if let Err(err) = logging::init_with_config(bin_name, &config.log) {
        eprintln!("failed to initialize logging, {err}");
        return crate::EXIT_CODE_LOAD_CONFIG_FAILURE.into();
    }

    trace!("{:?}", config);

    if config.server_address.is_empty() {
        eprintln!(
            "missing `server_address`, consider specifying it by --server-addr command line option, \
                or \"server\" and \"server_port\" in configuration file"
        );
        return crate::EXIT_CODE_INSUFFICIENT_PARAMS.into();
    }

    if let Err(err) = config.check_integrity() {
        eprintln!("config integrity check failed, {err}");
        return crate::EXIT_CODE_LOAD_CONFIG_FAILURE.into();
    }

    info!("{} {}", bin_name, crate::VERSION);

    match crate::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("server aborted with {err}");
            crate::EXIT_CODE_SERVER_ABORTED.into()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_line_overrides_defaults() {
        let app = local::define_command_line_options(Command::new("fslocal"));
        let matches = app
            .try_get_matches_from([
                "fslocal",
                "-s",
                "203.0.113.1",
                "-p",
                "8881",
                "-l",
                "1081",
                "--dns",
                "cloudflare",
                "--multiplexer",
                "poll",
                "-vv",
            ])
            .unwrap();

        let config = load_config(&matches, ConfigType::Local).unwrap();
        assert!(config.is_local());
        assert_eq!(config.server_address, "203.0.113.1");
        assert_eq!(config.server_port, 8881);
        assert_eq!(config.local_port, 1081);
        assert_eq!(config.nameservers.len(), 2);
        assert_eq!(config.multiplexer, MultiplexerKind::Poll);
        assert_eq!(config.log.level, 2);
    }

    #[test]
    fn server_has_no_local_options() {
        let app = server::define_command_line_options(Command::new("fsserver"));
        assert!(app.try_get_matches_from(["fsserver", "-l", "1080"]).is_err());
    }
}
