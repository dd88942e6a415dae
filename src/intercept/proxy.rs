//! Detection of HTTP CONNECT requests written on an intercepted connection.
//!
//! When a process talks to a forward proxy, the socket connects to the proxy
//! while the real destination only appears in the request line:
//!
//! ```text
//! CONNECT api.example.com:443 HTTP/1.1
//! ```

use crate::policy::parse_host_port;

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// Extract the target of a CONNECT request line, if `bytes` starts with one.
pub fn parse_connect_request(bytes: &[u8]) -> Option<(String, u16)> {
    let rest = bytes.strip_prefix(CONNECT_PREFIX)?;
    let line_end = rest
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(rest.len());
    let line = std::str::from_utf8(&rest[..line_end]).ok()?;

    let (authority, version) = line.split_once(' ')?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parse_host_port(authority).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_request() {
        let request = b"CONNECT api.example.com:443 HTTP/1.1\r\nHost: api.example.com:443\r\n\r\n";
        assert_eq!(
            parse_connect_request(request),
            Some(("api.example.com".to_string(), 443))
        );
    }

    #[test]
    fn test_parse_connect_ipv6() {
        assert_eq!(
            parse_connect_request(b"CONNECT [::1]:8443 HTTP/1.0\r\n"),
            Some(("::1".to_string(), 8443))
        );
    }

    #[test]
    fn test_not_a_connect_request() {
        assert_eq!(parse_connect_request(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(parse_connect_request(b"CONNECT api.example.com:443\r\n"), None);
        assert_eq!(parse_connect_request(b"CONNECT api.example.com HTTP/1.1\r\n"), None);
        assert_eq!(parse_connect_request(b"\x16\x03\x01\x02\x00"), None);
    }
}
