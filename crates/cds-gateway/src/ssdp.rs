use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};

const SSDP_MULTICAST: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900));

pub const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

pub fn make_search_request(search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {search_target}\r\n\
         \r\n"
    )
}

#[derive(Debug, Clone)]
pub struct DiscoverResponse {
    pub location: Url,
    pub from: SocketAddr,
}

fn parse_response(buf: &[u8], from: SocketAddr) -> anyhow::Result<DiscoverResponse> {
    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut resp = httparse::Response::new(&mut headers);
    resp.parse(buf)?;

    match resp.code {
        Some(200) => {}
        other => anyhow::bail!("bad SSDP response code {other:?}, expected 200"),
    }

    let location = resp
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("location"))
        .ok_or_else(|| anyhow::anyhow!("missing LOCATION header"))?;
    let location = std::str::from_utf8(location.value)?;
    let location = Url::parse(location)?;
    Ok(DiscoverResponse { location, from })
}

/// Send one SSDP M-SEARCH and return the first valid responder (spec.md §4.1:
/// "first valid response wins").
pub async fn discover_once(timeout: Duration) -> Result<DiscoverResponse> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(Error::Send)?;

    let message = make_search_request(SEARCH_TARGET);
    socket
        .send_to(message.as_bytes(), SSDP_MULTICAST)
        .await
        .map_err(Error::Send)?;

    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::DiscoveryTimeout(timeout));
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => match parse_response(&buf[..len], from) {
                Ok(r) => {
                    debug!(location = %r.location, %from, "discovered IGD");
                    return Ok(r);
                }
                Err(e) => {
                    warn!(%from, "ignoring malformed SSDP response: {e:#}");
                    continue;
                }
            },
            Ok(Err(e)) => return Err(Error::Send(e)),
            Err(_) => return Err(Error::DiscoveryTimeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_request_has_mandatory_headers() {
        let req = make_search_request(SEARCH_TARGET);
        assert!(req.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(req.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(req.contains(&format!("ST: {SEARCH_TARGET}\r\n")));
    }

    #[test]
    fn parses_valid_response() {
        let raw = b"HTTP/1.1 200 OK\r\nLOCATION: http://192.168.1.1:5000/desc.xml\r\nST: upnp:rootdevice\r\n\r\n";
        let r = parse_response(raw, "192.168.1.1:1900".parse().unwrap()).unwrap();
        assert_eq!(r.location.as_str(), "http://192.168.1.1:5000/desc.xml");
    }

    #[test]
    fn rejects_non_200() {
        let raw = b"HTTP/1.1 404 Not Found\r\n\r\n";
        assert!(parse_response(raw, "192.168.1.1:1900".parse().unwrap()).is_err());
    }
}
