//! This is a binary running in the local environment
//!
//! You have to provide all needed configuration attributes via command line parameters,
//! or you could specify a configuration file. The format of configuration file is defined
//! in mod `config`.

use std::process::ExitCode;

use clap::Command;
use fssocks::service::local;

fn main() -> ExitCode {
    let mut app = Command::new("fslocal")
        .version(fssocks::VERSION)
        .about("SOCKS5 forwarding proxy, local side");
    app = local::define_command_line_options(app);

    let matches = app.get_matches();
    local::main(&matches)
}
