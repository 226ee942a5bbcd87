use std::net::{IpAddr, SocketAddr};

/// What the front door knows about the caller's software.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Client {
    pub browser: String,
    pub os: String,
    pub raw: String,
}

const BROWSERS: &[(&str, &str)] = &[
    ("Edg/", "Edge"),
    ("OPR/", "Opera"),
    ("Opera", "Opera"),
    ("Firefox/", "Firefox"),
    ("CriOS/", "Chrome"),
    ("Chrome/", "Chrome"),
    ("Chromium/", "Chromium"),
    ("Safari/", "Safari"),
    ("curl/", "curl"),
    ("Wget/", "Wget"),
    (concat!(env!("CARGO_PKG_NAME"), "/"), "cli"),
];

const SYSTEMS: &[(&str, &str)] = &[
    ("Windows", "Windows"),
    ("Android", "Android"),
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("Mac OS X", "macOS"),
    ("Macintosh", "macOS"),
    ("CrOS", "ChromeOS"),
    ("FreeBSD", "FreeBSD"),
    ("OpenBSD", "OpenBSD"),
    ("Linux", "Linux"),
];

fn first_match(ua: &str, table: &[(&str, &str)]) -> Option<String> {
    table
        .iter()
        .find(|(needle, _)| ua.contains(needle))
        .map(|(_, name)| (*name).to_string())
}

/// Classifies a `User-Agent`. Unrecognised agents on loopback are the
/// local command line tool.
#[must_use]
pub fn parse_user_agent(ua: &str, loopback: bool) -> Client {
    let browser = first_match(ua, BROWSERS);
    let os = first_match(ua, SYSTEMS);

    let (browser, os) = match (browser, os) {
        (None, None) if loopback => ("cli".to_string(), "local".to_string()),
        (browser, os) => (
            browser.unwrap_or_else(|| "unknown".to_string()),
            os.unwrap_or_else(|| "unknown".to_string()),
        ),
    };

    Client {
        browser,
        os,
        raw: ua.to_string(),
    }
}

/// The address part of a remote, accepting `ip`, `ip:port` and `[v6]:port`.
/// IPv4-mapped v6 addresses, as seen on a dual-stack listener, come back
/// as plain IPv4.
#[must_use]
pub fn parse_remote(remote: &str) -> Option<IpAddr> {
    let remote = remote.trim();
    remote
        .parse::<SocketAddr>()
        .map(|sa| sa.ip())
        .or_else(|_| remote.trim_start_matches('[').trim_end_matches(']').parse())
        .ok()
        .map(|ip: IpAddr| ip.to_canonical())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browsers() {
        let ff = parse_user_agent(
            "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
            false,
        );
        assert_eq!((ff.browser.as_str(), ff.os.as_str()), ("Firefox", "Linux"));

        let edge = parse_user_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/126.0.0.0 Safari/537.36 Edg/126.0.0.0",
            false,
        );
        assert_eq!((edge.browser.as_str(), edge.os.as_str()), ("Edge", "Windows"));

        let phone = parse_user_agent(
            "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 Chrome/126.0 Mobile Safari/537.36",
            false,
        );
        assert_eq!((phone.browser.as_str(), phone.os.as_str()), ("Chrome", "Android"));
    }

    #[test]
    fn unknown_agents() {
        let local = parse_user_agent("", true);
        assert_eq!((local.browser.as_str(), local.os.as_str()), ("cli", "local"));

        let remote = parse_user_agent("", false);
        assert_eq!((remote.browser.as_str(), remote.os.as_str()), ("unknown", "unknown"));

        let tool = parse_user_agent("curl/8.5.0", true);
        assert_eq!((tool.browser.as_str(), tool.os.as_str()), ("curl", "unknown"));
    }

    #[test]
    fn remotes() {
        assert_eq!(parse_remote("192.0.2.4:5555"), Some("192.0.2.4".parse().unwrap()));
        assert_eq!(parse_remote("[2001:db8::6]:80"), Some("2001:db8::6".parse().unwrap()));
        assert_eq!(parse_remote("2001:db8::6"), Some("2001:db8::6".parse().unwrap()));
        assert_eq!(parse_remote("127.0.0.1"), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(parse_remote("nowhere"), None);
    }

    #[test]
    fn mapped_remotes_are_ipv4() {
        let local = parse_remote("[::ffff:127.0.0.1]:5").unwrap();
        assert_eq!(local, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert!(local.is_loopback());

        assert_eq!(parse_remote("::ffff:192.0.2.4"), Some("192.0.2.4".parse().unwrap()));
        assert!(parse_remote("[::1]:80").unwrap().is_loopback());
    }
}
