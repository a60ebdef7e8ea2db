use crate::head::RequestHead;
use crate::Config;
use netra_addr::Addr;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Targets in a routing list default to this port when they carry none.
const DEFAULT_ROUTE_PORT: u16 = 80;

#[derive(Debug, PartialEq, Eq)]
struct MalformedRoutes;

/// Picks the upstream for a connection from the first request's routing
/// header (or cookie), falling back to the original destination.
///
/// The routing value is a `;`-separated list of `host=target` pairs keyed
/// by the request's `Host` header. A malformed list is ignored with a
/// warning and the connection proceeds to the original destination.
pub(crate) fn decide(config: &Config, head: &RequestHead, orig_dst: SocketAddr) -> Addr {
    let value = routing_value(config, head);
    if let Some(value) = value {
        match parse_pairs(&value) {
            Ok(pairs) => {
                let host = head.host();
                if let Some((_, target)) = pairs.iter().find(|(h, _)| h == host) {
                    match Addr::from_str_and_port(target, DEFAULT_ROUTE_PORT) {
                        Ok(addr) => {
                            debug!(%host, %addr, "Routing override");
                            return addr;
                        }
                        Err(_) => {
                            warn!(%target, "Ignoring route with unparseable target")
                        }
                    }
                }
            }
            Err(MalformedRoutes) => {
                warn!(%value, "Ignoring malformed routing value");
            }
        }
    }
    Addr::Socket(orig_dst)
}

/// The raw routing list carried by a request, if any. The header wins over
/// the cookie.
pub(crate) fn routing_value(config: &Config, head: &RequestHead) -> Option<String> {
    if let Some(v) = head.headers.get_str(&config.routing_header) {
        return Some(v.to_string());
    }
    if config.routing_cookie_enabled {
        return head.headers.cookie(&config.routing_cookie);
    }
    None
}

fn parse_pairs(value: &str) -> Result<Vec<(String, String)>, MalformedRoutes> {
    let mut pairs = Vec::new();
    for pair in value.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((host, target)) if !host.is_empty() && !target.is_empty() => {
                pairs.push((host.trim().to_string(), target.trim().to_string()));
            }
            _ => return Err(MalformedRoutes),
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::parse_request;

    fn config() -> Config {
        Config::default()
    }

    fn request(raw: &[u8]) -> RequestHead {
        parse_request(raw).unwrap().unwrap().0
    }

    const ORIG: ([u8; 4], u16) = ([10, 1, 1, 1], 9000);

    #[test]
    fn host_match_rewrites_upstream() {
        let head = request(
            b"GET / HTTP/1.1\r\nHost: example.com\r\nX-Route: example.com=10.0.0.5:8080\r\n\r\n",
        );
        let addr = decide(&config(), &head, ORIG.into());
        assert_eq!(addr, Addr::Socket(([10, 0, 0, 5], 8080).into()));
    }

    #[test]
    fn port_defaults_to_80() {
        let head =
            request(b"GET / HTTP/1.1\r\nHost: example.com\r\nX-Route: example.com=10.0.0.5\r\n\r\n");
        let addr = decide(&config(), &head, ORIG.into());
        assert_eq!(addr, Addr::Socket(([10, 0, 0, 5], 80).into()));
    }

    #[test]
    fn unmatched_host_keeps_original_destination() {
        let head =
            request(b"GET / HTTP/1.1\r\nHost: other.com\r\nX-Route: example.com=10.0.0.5\r\n\r\n");
        let addr = decide(&config(), &head, ORIG.into());
        assert_eq!(addr, Addr::Socket(ORIG.into()));
    }

    #[test]
    fn malformed_list_is_ignored_entirely() {
        let head = request(
            b"GET / HTTP/1.1\r\nHost: a\r\nX-Route: a=10.0.0.5;nonsense;b=10.0.0.6\r\n\r\n",
        );
        let addr = decide(&config(), &head, ORIG.into());
        assert_eq!(addr, Addr::Socket(ORIG.into()));
    }

    #[test]
    fn multiple_pairs_select_by_host() {
        let head = request(
            b"GET / HTTP/1.1\r\nHost: b.svc\r\nX-Route: a.svc=10.0.0.5;b.svc=10.0.0.6:9090\r\n\r\n",
        );
        let addr = decide(&config(), &head, ORIG.into());
        assert_eq!(addr, Addr::Socket(([10, 0, 0, 6], 9090).into()));
    }

    #[test]
    fn cookie_supplies_routes_when_enabled() {
        let mut cfg = config();
        cfg.routing_cookie_enabled = true;
        let head = request(
            b"GET / HTTP/1.1\r\nHost: a\r\nCookie: NETRA-ROUTE=a=10.0.0.7:81\r\n\r\n",
        );
        let addr = decide(&cfg, &head, ORIG.into());
        assert_eq!(addr, Addr::Socket(([10, 0, 0, 7], 81).into()));

        // Disabled by default.
        let addr = decide(&config(), &head, ORIG.into());
        assert_eq!(addr, Addr::Socket(ORIG.into()));
    }

    #[test]
    fn named_targets_resolve_at_dial_time() {
        let head = request(
            b"GET / HTTP/1.1\r\nHost: example.com\r\nX-Route: example.com=backend.internal\r\n\r\n",
        );
        match decide(&config(), &head, ORIG.into()) {
            Addr::Name(na) => {
                assert_eq!(na.name(), "backend.internal");
                assert_eq!(na.port(), 80);
            }
            addr => panic!("unexpected {:?}", addr),
        }
    }
}
