//! This is a binary running in the server environment
//!
//! You have to provide all needed configuration attributes via command line parameters,
//! or you could specify a configuration file. The format of configuration file is defined
//! in mod `config`.

use std::process::ExitCode;

use clap::Command;
use fssocks::service::server;

fn main() -> ExitCode {
    let mut app = Command::new("fsserver")
        .version(fssocks::VERSION)
        .about("SOCKS5 forwarding proxy, server side");
    app = server::define_command_line_options(app);

    let matches = app.get_matches();
    server::main(&matches)
}
