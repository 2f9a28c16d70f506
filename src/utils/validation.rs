// Validation utilities
use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;
use url::{Host, Url};

// List of commonly blocked ports
const BLOCKED_PORTS: &[u16] = &[
    22,    // SSH
    23,    // Telnet
    25,    // SMTP
    3306,  // MySQL
    5432,  // PostgreSQL
    6379,  // Redis
    27017, // MongoDB
];

const MAX_PATH_LEN: usize = 255;

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_private() // 10/8, 172.16/12, 192.168/16
        || ip.is_loopback() // 127/8
        || ip.is_link_local() // 169.254/16
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 (carrier-grade NAT)
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&mapped);
    }
    ip.is_loopback()
        || ip.is_unspecified()
        // fe80::/10 (link-local)
        || (ip.segments()[0] & 0xffc0) == 0xfe80
        // fc00::/7 (unique local)
        || (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// Check if an IP address is loopback, private, link-local or unspecified
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn disallowed_host(url_str: &str, reason: &str) -> Error {
    warn!("Security: Blocked URL {} ({})", url_str, reason);
    Error::Validation(format!("disallowed host: {reason}"))
}

/// Validate a URL found in third-party content: it must parse, use http or
/// https, and must not point at localhost, a private network or a
/// restricted port.
///
/// Host-policy rejections carry the phrase "disallowed host".
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str.trim())?;

    // Check scheme
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            warn!(
                "Security: Blocked non-HTTP(S) URL scheme: {} in URL: {}",
                scheme, url_str
            );
            return Err(Error::Validation(format!(
                "disallowed scheme '{scheme}': URL must use http or https"
            )));
        }
    }

    match url.host() {
        None => return Err(Error::Validation("URL must have a valid host".to_string())),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(disallowed_host(url_str, "localhost"));
            }
        }
        Some(Host::Ipv4(ip)) => {
            if is_private_ipv4(&ip) {
                return Err(disallowed_host(
                    url_str,
                    &format!("{ip} is a loopback or private network address"),
                ));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_private_ipv6(&ip) {
                return Err(disallowed_host(
                    url_str,
                    &format!("{ip} is a loopback or private network address"),
                ));
            }
        }
    }

    // Check port restrictions
    if let Some(port) = url.port() {
        if BLOCKED_PORTS.contains(&port) {
            warn!(
                "Security: Blocked restricted port {} in URL: {}",
                port, url_str
            );
            return Err(Error::Validation(format!(
                "Port {port} is not allowed for security reasons"
            )));
        }
    }

    Ok(url)
}

/// Validate a repository-relative file path before it is placed in an API
/// request: relative, no `..` segments, no backslashes or control characters.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Validation("Path must not be empty".to_string()));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(Error::Validation(format!(
            "Path exceeds {MAX_PATH_LEN} characters"
        )));
    }
    if path.starts_with('/') {
        return Err(Error::Validation(format!(
            "Path must be relative to the repository root: {path}"
        )));
    }
    if path.contains('\\') || path.chars().any(char::is_control) {
        return Err(Error::Validation(format!(
            "Path contains forbidden characters: {}",
            path.escape_debug()
        )));
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err(Error::Validation(format!(
            "Path contains empty or parent segments: {path}"
        )));
    }
    Ok(())
}
