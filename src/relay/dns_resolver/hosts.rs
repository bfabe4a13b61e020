//! Hosts file

use std::{collections::HashMap, fs, io, net::IpAddr, path::Path};

use log::trace;

/// Platform hosts file
pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Parse `ip name [aliases...]` lines
///
/// `#` starts a comment, lines whose address doesn't parse are skipped and the first
/// mapping of a name wins.
pub fn parse_hosts(content: &str) -> HashMap<String, IpAddr> {
    let mut hosts = HashMap::new();

    for line in content.lines() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };

        let mut fields = line.split_whitespace();
        let ip = match fields.next().map(str::parse::<IpAddr>) {
            Some(Ok(ip)) => ip,
            Some(Err(..)) => {
                trace!("hosts line ignored: {}", line);
                continue;
            }
            None => continue,
        };

        for name in fields {
            hosts.entry(name.to_owned()).or_insert(ip);
        }
    }

    hosts
}

/// Read and parse a hosts file
pub fn load_hosts<P: AsRef<Path>>(path: P) -> io::Result<HashMap<String, IpAddr>> {
    let content = fs::read_to_string(path)?;
    Ok(parse_hosts(&content))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_hosts_lines() {
        let hosts = parse_hosts(
            "# comment line\n\
             127.0.0.1\tlocalhost loopback\n\
             \n\
             ::1 localhost ip6-localhost # trailing comment\n\
             not-an-ip bogus\n\
             10.0.0.2   \n\
             192.168.1.10 nas.lan\n",
        );

        assert_eq!(hosts.get("localhost"), Some(&"127.0.0.1".parse().unwrap()));
        assert_eq!(hosts.get("loopback"), Some(&"127.0.0.1".parse().unwrap()));
        assert_eq!(hosts.get("ip6-localhost"), Some(&"::1".parse().unwrap()));
        assert_eq!(hosts.get("nas.lan"), Some(&"192.168.1.10".parse().unwrap()));
        assert!(!hosts.contains_key("bogus"));
        assert!(!hosts.contains_key("comment"));
        assert_eq!(hosts.len(), 4);
    }
}
