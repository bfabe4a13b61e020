//! This is a mod for storing and parsing configuration
//!
//! The configuration file is in JSON (json5 is accepted):
//!
//! ```ignore
//! {
//!     "server": "203.0.113.1",
//!     "server_port": 8388,
//!     "local_address": "127.0.0.1",
//!     "local_port": 1080,
//!     "method": "none",
//!     "nameserver": "114.114.114.114",
//!     "hosts_file": "/etc/hosts",
//!     "udp_timeout": 300,
//!     "multiplexer": "mio"
//! }
//! ```
//!
//! `nameserver` is a comma separated list of `ip` or `ip:port`, or one of the presets
//! `google` and `cloudflare`.

use std::{
    fmt::{self, Debug, Display, Formatter},
    fs::OpenOptions,
    io::Read,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    crypto::CipherKind,
    event_loop::MultiplexerKind,
    relay::{
        dns_resolver::{DEFAULT_HOSTS_PATH, DNS_PORT},
        udprelay::DEFAULT_UDP_TIMEOUT,
    },
};

pub const DEFAULT_LOCAL_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: u16 = 1080;
pub const DEFAULT_SERVER_PORT: u16 = 8388;
pub const DEFAULT_NAMESERVER: &str = "114.114.114.114";

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    local_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    udp_timeout: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", alias = "dns")]
    nameserver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hosts_file: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    multiplexer: Option<String>,
}

/// Server config type
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigType {
    /// Config for local
    Local,

    /// Config for server
    Server,
}

impl ConfigType {
    /// Check if it is local server type
    pub fn is_local(self) -> bool {
        self == ConfigType::Local
    }

    /// Check if it is remote server type
    pub fn is_server(self) -> bool {
        self == ConfigType::Server
    }
}

/// Log configuration
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Default logger log level, [0, 3]
    pub level: u32,
    /// Omit timestamps
    pub without_time: bool,
    /// log4rs YAML file, replaces everything above
    pub config_path: Option<PathBuf>,
}

/// Configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub config_type: ConfigType,

    /// Relay server, the upstream of the client role and the listen address of the server role
    pub server_address: String,
    pub server_port: u16,

    /// Listen address of the client role
    pub local_address: String,
    pub local_port: u16,

    pub method: CipherKind,

    pub nameservers: Vec<SocketAddr>,
    pub hosts_path: PathBuf,

    /// Idle timeout of UDP associations
    pub udp_timeout: Duration,

    pub multiplexer: MultiplexerKind,

    pub log: LogConfig,

    /// Path of the file this configuration was loaded from
    pub config_path: Option<PathBuf>,
}

/// Configuration parsing error kind
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Missing required fields in JSON configuration
    MissingField,
    /// Missing some keys that must be provided together
    Malformed,
    /// Invalid value of some configuration keys
    Invalid,
    /// Invalid JSON
    JsonParsingError,
    /// `std::io::Error`
    IoError,
}

/// Configuration parsing error
pub struct Error {
    pub kind: ErrorKind,
    pub desc: &'static str,
    pub detail: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, desc: &'static str, detail: Option<String>) -> Error {
        Error { kind, desc, detail }
    }
}

macro_rules! impl_from {
    ($error:ty, $kind:expr, $desc:expr) => {
        impl From<$error> for Error {
            fn from(err: $error) -> Self {
                Error::new($kind, $desc, Some(format!("{:?}", err)))
            }
        }
    };
}

impl_from!(::std::io::Error, ErrorKind::IoError, "error while reading file");
impl_from!(json5::Error, ErrorKind::JsonParsingError, "json parse error");

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.detail {
            None => write!(f, "{}", self.desc),
            Some(ref det) => write!(f, "{} {}", self.desc, det),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.detail {
            None => f.write_str(self.desc),
            Some(ref d) => write!(f, "{}, {}", self.desc, d),
        }
    }
}

impl std::error::Error for Error {}

/// Parse a nameserver list, `ip`, `ip:port` separated by `,`, or a preset name
pub fn parse_nameservers(s: &str) -> Result<Vec<SocketAddr>, Error> {
    let preset: &[[u8; 4]] = match s.trim() {
        "google" => &[[8, 8, 8, 8], [8, 8, 4, 4]],
        "cloudflare" => &[[1, 1, 1, 1], [1, 0, 0, 1]],
        _ => &[],
    };
    if !preset.is_empty() {
        return Ok(preset
            .iter()
            .map(|ip| SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), DNS_PORT))
            .collect());
    }

    let mut servers = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let addr = match part.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(..) => match part.parse::<IpAddr>() {
                Ok(ip) => SocketAddr::new(ip, DNS_PORT),
                Err(..) => {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        "invalid nameserver",
                        Some(format!("`{}` is neither an IP nor an IP:port", part)),
                    ))
                }
            },
        };
        servers.push(addr);
    }

    if servers.is_empty() {
        return Err(Error::new(ErrorKind::Invalid, "empty nameserver list", None));
    }
    Ok(servers)
}

impl Config {
    /// Creates a configuration filled with defaults
    pub fn new(config_type: ConfigType) -> Config {
        Config {
            config_type,
            server_address: String::new(),
            server_port: DEFAULT_SERVER_PORT,
            local_address: DEFAULT_LOCAL_ADDRESS.to_owned(),
            local_port: DEFAULT_LOCAL_PORT,
            method: CipherKind::None,
            nameservers: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(114, 114, 114, 114)),
                DNS_PORT,
            )],
            hosts_path: PathBuf::from(DEFAULT_HOSTS_PATH),
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            multiplexer: MultiplexerKind::default(),
            log: LogConfig::default(),
            config_path: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.config_type.is_local()
    }

    /// Address the relays of this role listen on
    pub fn listen_address(&self) -> (&str, u16) {
        if self.is_local() {
            (&self.local_address, self.local_port)
        } else {
            (&self.server_address, self.server_port)
        }
    }

    /// String value of `key`
    pub fn get_str(&self, key: &str) -> Result<String, Error> {
        match key {
            "server_address" => Ok(self.server_address.clone()),
            "local_address" => Ok(self.local_address.clone()),
            "server_port" | "local_port" | "is_local" => self.get_int(key).map(|v| v.to_string()),
            _ => Err(unknown_key(key)),
        }
    }

    /// Integer value of `key`, `is_local` reads as 0 or 1
    pub fn get_int(&self, key: &str) -> Result<i64, Error> {
        match key {
            "server_port" => Ok(i64::from(self.server_port)),
            "local_port" => Ok(i64::from(self.local_port)),
            "is_local" => Ok(i64::from(self.is_local())),
            "server_address" | "local_address" => {
                let value = self.get_str(key)?;
                value.parse::<i64>().map_err(|_| {
                    Error::new(
                        ErrorKind::Invalid,
                        "not an integer",
                        Some(format!("`{}` is `{}`", key, value)),
                    )
                })
            }
            _ => Err(unknown_key(key)),
        }
    }

    pub fn set_str(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "server_address" => self.server_address = value.to_owned(),
            "local_address" => self.local_address = value.to_owned(),
            "server_port" | "local_port" | "is_local" => {
                let value = value.parse::<i64>().map_err(|_| {
                    Error::new(
                        ErrorKind::Invalid,
                        "not an integer",
                        Some(format!("`{}` can't be `{}`", key, value)),
                    )
                })?;
                return self.set_int(key, value);
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> Result<(), Error> {
        let port = || {
            u16::try_from(value).map_err(|_| {
                Error::new(
                    ErrorKind::Invalid,
                    "port out of range",
                    Some(format!("`{}` can't be {}", key, value)),
                )
            })
        };

        match key {
            "server_port" => self.server_port = port()?,
            "local_port" => self.local_port = port()?,
            "is_local" => {
                self.config_type = if value != 0 {
                    ConfigType::Local
                } else {
                    ConfigType::Server
                }
            }
            "server_address" | "local_address" => return self.set_str(key, &value.to_string()),
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    fn load_from_ssconfig(config: SSConfig, config_type: ConfigType) -> Result<Config, Error> {
        let mut nconfig = Config::new(config_type);

        if let Some(server) = config.server {
            nconfig.server_address = server;
        }
        if let Some(port) = config.server_port {
            nconfig.server_port = port;
        }
        if let Some(addr) = config.local_address {
            nconfig.local_address = addr;
        }
        if let Some(port) = config.local_port {
            nconfig.local_port = port;
        }

        if let Some(m) = config.method {
            nconfig.method = match m.parse::<CipherKind>() {
                Ok(m) => m,
                Err(..) => {
                    let err = Error::new(
                        ErrorKind::Invalid,
                        "unsupported method",
                        Some(format!("`{}` is not a supported method", m)),
                    );
                    return Err(err);
                }
            };
        }

        if let Some(t) = config.udp_timeout {
            nconfig.udp_timeout = Duration::from_secs(t);
        }

        if let Some(ns) = config.nameserver {
            nconfig.nameservers = parse_nameservers(&ns)?;
        }
        if let Some(p) = config.hosts_file {
            nconfig.hosts_path = PathBuf::from(p);
        }

        if let Some(m) = config.multiplexer {
            nconfig.multiplexer = match MultiplexerKind::from_str(&m) {
                Ok(m) => m,
                Err(..) => {
                    let err = Error::new(
                        ErrorKind::Invalid,
                        "unsupported multiplexer",
                        Some(format!("`{}` is not a supported multiplexer", m)),
                    );
                    return Err(err);
                }
            };
        }

        Ok(nconfig)
    }

    /// Load Config from a `str`
    pub fn load_from_str(s: &str, config_type: ConfigType) -> Result<Config, Error> {
        let c = json5::from_str::<SSConfig>(s)?;
        Config::load_from_ssconfig(c, config_type)
    }

    /// Load Config from a File
    pub fn load_from_file<P: AsRef<Path>>(filename: P, config_type: ConfigType) -> Result<Config, Error> {
        let filename = filename.as_ref();

        let mut reader = OpenOptions::new().read(true).open(filename)?;
        let mut content = String::new();
        reader.read_to_string(&mut content)?;

        let mut config = Config::load_from_str(&content[..], config_type)?;
        config.config_path = Some(filename.to_owned());

        Ok(config)
    }

    /// Check if all required fields are present
    pub fn check_integrity(&self) -> Result<(), Error> {
        if self.server_address.is_empty() {
            return Err(Error::new(
                ErrorKind::MissingField,
                "missing `server_address`",
                None,
            ));
        }
        if self.is_local() && self.local_address.is_empty() {
            return Err(Error::new(ErrorKind::MissingField, "missing `local_address`", None));
        }
        if self.nameservers.is_empty() {
            return Err(Error::new(ErrorKind::MissingField, "missing nameservers", None));
        }
        Ok(())
    }
}

fn unknown_key(key: &str) -> Error {
    Error::new(ErrorKind::Invalid, "unknown configuration key", Some(format!("`{}`", key)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn load_from_json5() {
        let config = Config::load_from_str(
            r#"{
                // comments are fine
                server: "203.0.113.1",
                server_port: 8881,
                local_port: 1081,
                method: "none",
                nameserver: "8.8.8.8, 1.1.1.1:5353",
                udp_timeout: 60,
                multiplexer: "poll",
            }"#,
            ConfigType::Local,
        )
        .unwrap();

        assert_eq!(config.server_address, "203.0.113.1");
        assert_eq!(config.server_port, 8881);
        assert_eq!(config.local_address, DEFAULT_LOCAL_ADDRESS);
        assert_eq!(config.local_port, 1081);
        assert_eq!(
            config.nameservers,
            vec![
                "8.8.8.8:53".parse::<SocketAddr>().unwrap(),
                "1.1.1.1:5353".parse::<SocketAddr>().unwrap(),
            ]
        );
        assert_eq!(config.udp_timeout, Duration::from_secs(60));
        assert_eq!(config.multiplexer, MultiplexerKind::Poll);
        assert_eq!(config.hosts_path, PathBuf::from(DEFAULT_HOSTS_PATH));
        assert_eq!(config.listen_address(), ("127.0.0.1", 1081));
        assert!(config.check_integrity().is_ok());
    }

    #[test]
    fn load_rejects_bad_values() {
        let err = Config::load_from_str(r#"{"method": "rot13"}"#, ConfigType::Server).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);

        let err = Config::load_from_str(r#"{"nameserver": "dns.example"}"#, ConfigType::Server).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);

        let err = Config::load_from_str("{ server: ", ConfigType::Server).unwrap_err();
        assert_eq!(err.kind, ErrorKind::JsonParsingError);

        let err = Config::load_from_file("/nonexistent/fssocks.json", ConfigType::Server).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IoError);
    }

    #[test]
    fn typed_access_by_key() {
        let mut config = Config::new(ConfigType::Server);
        config.set_str("server_address", "0.0.0.0").unwrap();
        config.set_int("server_port", 8881).unwrap();

        assert_eq!(config.get_str("server_address").unwrap(), "0.0.0.0");
        assert_eq!(config.get_int("server_port").unwrap(), 8881);
        assert_eq!(config.get_str("server_port").unwrap(), "8881");
        assert_eq!(config.get_int("is_local").unwrap(), 0);
        assert_eq!(config.listen_address(), ("0.0.0.0", 8881));

        assert_eq!(config.set_int("local_port", 70000).unwrap_err().kind, ErrorKind::Invalid);
        assert_eq!(config.get_int("password").unwrap_err().kind, ErrorKind::Invalid);
        assert_eq!(config.get_int("server_address").unwrap_err().kind, ErrorKind::Invalid);

        config.set_int("is_local", 1).unwrap();
        assert!(config.is_local());
    }

    #[test]
    fn nameserver_presets() {
        assert_eq!(
            parse_nameservers("google").unwrap(),
            vec![
                "8.8.8.8:53".parse::<SocketAddr>().unwrap(),
                "8.8.4.4:53".parse::<SocketAddr>().unwrap(),
            ]
        );
        assert_eq!(parse_nameservers("cloudflare").unwrap().len(), 2);
        assert_eq!(
            parse_nameservers("[2001:4860:4860::8888]:53").unwrap(),
            vec!["[2001:4860:4860::8888]:53".parse::<SocketAddr>().unwrap()]
        );
        assert!(parse_nameservers(" , ").is_err());
    }
}
