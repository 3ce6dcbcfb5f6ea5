//! Line-delimited proxy list format.
//!
//! Accepted forms, one per line:
//! `host:port`, `host:port:user:pass`, `user:pass@host:port`, and any of
//! those prefixed with `http://`, `https://` or `socks5://`. Blank lines and
//! `#` comments are ignored.

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    /// `host:port`, used as the pool key and in logs. Never carries credentials.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn proxy_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn to_reqwest(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        let proxy = reqwest::Proxy::all(self.proxy_url())?;
        Ok(match (&self.username, &self.password) {
            (Some(user), Some(pass)) => proxy.basic_auth(user, pass),
            _ => proxy,
        })
    }

    /// Serialises back into the list format `parse_line` accepts.
    pub fn to_line(&self) -> String {
        let base = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}:{}:{}", self.host, self.port, user, pass),
            _ => self.address(),
        };
        if self.scheme == "http" {
            base
        } else {
            format!("{}://{}", self.scheme, base)
        }
    }
}

pub fn parse_line(line: &str) -> Option<ProxyEndpoint> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (scheme, rest) = match line.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("http".to_string(), line),
    };
    if !matches!(scheme.as_str(), "http" | "https" | "socks5" | "socks5h") {
        return None;
    }

    if let Some((creds, host_port)) = rest.rsplit_once('@') {
        let (user, pass) = creds.split_once(':')?;
        let (host, port) = host_port.rsplit_once(':')?;
        return endpoint(scheme, host, port, Some((user, pass)));
    }

    let parts: Vec<&str> = rest.split(':').collect();
    match parts.len() {
        2 => endpoint(scheme, parts[0], parts[1], None),
        n if n >= 4 => {
            let user = parts[2..n - 1].join(":");
            endpoint(scheme, parts[0], parts[1], Some((&user, parts[n - 1])))
        }
        _ => None,
    }
}

fn endpoint(
    scheme: String,
    host: &str,
    port: &str,
    creds: Option<(&str, &str)>,
) -> Option<ProxyEndpoint> {
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    let (username, password) = match creds {
        Some((user, pass)) if !user.is_empty() => (Some(user.to_string()), Some(pass.to_string())),
        Some(_) => return None,
        None => (None, None),
    };
    Some(ProxyEndpoint {
        scheme,
        host: host.to_string(),
        port,
        username,
        password,
    })
}

/// Parses a whole list, skipping (and logging) malformed lines.
pub fn parse_list(text: &str) -> Vec<ProxyEndpoint> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_line(trimmed) {
            Some(ep) => out.push(ep),
            None => warn!(line = idx + 1, "Skipping malformed proxy entry"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let ep = parse_line("10.0.0.1:8080").unwrap();
        assert_eq!(ep.address(), "10.0.0.1:8080");
        assert_eq!(ep.scheme, "http");
        assert!(ep.username.is_none());
    }

    #[test]
    fn parses_credentials_with_colon_in_username() {
        let ep = parse_line("proxy.example.net:3128:user:session-1:secret").unwrap();
        assert_eq!(ep.host, "proxy.example.net");
        assert_eq!(ep.port, 3128);
        assert_eq!(ep.username.as_deref(), Some("user:session-1"));
        assert_eq!(ep.password.as_deref(), Some("secret"));
    }

    #[test]
    fn parses_at_form_and_scheme() {
        let ep = parse_line("socks5://alice:pw@1.2.3.4:1080").unwrap();
        assert_eq!(ep.scheme, "socks5");
        assert_eq!(ep.username.as_deref(), Some("alice"));
        assert_eq!(ep.address(), "1.2.3.4:1080");
        assert_eq!(ep.to_line(), "socks5://1.2.3.4:1080:alice:pw");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("# comment").is_none());
        assert!(parse_line("host-only").is_none());
        assert!(parse_line("host:notaport").is_none());
        assert!(parse_line("host:80:user").is_none());
        assert!(parse_line("ftp://host:21").is_none());
    }

    #[test]
    fn list_skips_bad_entries() {
        let text = "# pool\n1.1.1.1:80\n\nbad\n2.2.2.2:81:u:p\n";
        let eps = parse_list(text);
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[1].to_line(), "2.2.2.2:81:u:p");
    }
}
