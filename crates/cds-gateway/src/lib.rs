//! uPnP IGD client: discovery over SSDP, port mapping over SOAP.
//!
//! Implements spec.md §4.1. A `Gateway` is lazily discovered on first use and
//! caches its control URL for subsequent calls; `ready()` forces discovery
//! up front.

mod description;
mod error;
mod soap;
mod ssdp;

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

pub use error::{Error, Result, SoapFault};
pub use soap::PortMappingEntry;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub discover_timeout: Duration,
    /// Description set on every mapping this instance creates, so
    /// `listOpenPorts`/`closePort` can narrow to mappings this process owns
    /// (spec.md §4.1, resolving Open Question 6: narrow by description too).
    pub namespace: String,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            discover_timeout: Duration::from_secs(3),
            namespace: "cds".to_string(),
        }
    }
}

struct Discovered {
    control_url: Url,
    local_ip: IpAddr,
}

pub struct Gateway {
    opts: GatewayOptions,
    discovered: Mutex<Option<Discovered>>,
}

impl Gateway {
    pub fn new(opts: GatewayOptions) -> Self {
        Self {
            opts,
            discovered: Mutex::new(None),
        }
    }

    /// Run SSDP discovery, fetch the device description, and cache the
    /// `WANIPConnection` control URL. Idempotent: subsequent calls re-discover.
    pub async fn ready(&self) -> Result<()> {
        let response = ssdp::discover_once(self.opts.discover_timeout).await?;

        let body = reqwest::get(response.location.clone())
            .await
            .map_err(|e| Error::FetchDescription {
                url: response.location.to_string(),
                source: e.into(),
            })?
            .text()
            .await
            .map_err(|e| Error::FetchDescription {
                url: response.location.to_string(),
                source: e.into(),
            })?;

        let root: description::RootDesc = quick_xml::de::from_str(&body).map_err(|e| {
            Error::FetchDescription {
                url: response.location.to_string(),
                source: e.into(),
            }
        })?;

        let control_path = root
            .device
            .find_wan_ip_control_url()
            .ok_or(Error::NoWanIpConnectionService)?;
        let control_url = response
            .location
            .join(control_path)
            .map_err(|e| Error::FetchDescription {
                url: control_path.to_string(),
                source: e.into(),
            })?;

        let local_ip = local_ip_relative_to(response.from)?;

        debug!(%control_url, %local_ip, "uPnP gateway ready");
        *self.discovered.lock().unwrap() = Some(Discovered {
            control_url,
            local_ip,
        });
        Ok(())
    }

    fn control_url(&self) -> Result<Url> {
        self.discovered
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.control_url.clone())
            .ok_or(Error::NotReady)
    }

    pub async fn get_external_address(&self) -> Result<std::net::Ipv4Addr> {
        let control_url = self.control_url()?;
        soap::get_external_ip_address(&control_url).await
    }

    /// Maps `external_port` to `internal_port` on every non-loopback IPv4
    /// local interface, sequentially, tagged with this instance's namespace
    /// (spec.md §4.1).
    pub async fn open_port(&self, proto: &str, port: u16) -> Result<()> {
        let control_url = self.control_url()?;
        for local_ip in local_ipv4_addrs()? {
            soap::add_port_mapping(&control_url, proto, port, IpAddr::V4(local_ip), port, &self.opts.namespace)
                .await?;
        }
        Ok(())
    }

    /// Enumerates this gateway's mappings via repeated
    /// `GetGenericPortMappingEntry`, stopping at the first `errorCode 713`
    /// fault (spec.md §4.1), filtered to this instance's namespace.
    pub async fn list_open_ports(&self) -> Result<Vec<PortMappingEntry>> {
        let control_url = self.control_url()?;
        let mut out = Vec::new();
        let mut index = 0u32;
        loop {
            match soap::get_generic_port_mapping_entry(&control_url, index).await? {
                Some(entry) => {
                    if entry.description == self.opts.namespace {
                        out.push(entry);
                    }
                    index += 1;
                }
                None => break,
            }
        }
        Ok(out)
    }

    /// If both `proto` and `port` are given, deletes that single mapping.
    /// Otherwise enumerates this instance's mappings (narrowed by namespace
    /// and, if given, `proto`) and deletes each (spec.md §4.1, Open
    /// Question 6: narrow by description to avoid deleting foreign mappings
    /// that happen to share the `(proto, port)` pair).
    pub async fn close_port(&self, proto: Option<&str>, port: Option<u16>) -> Result<()> {
        let control_url = self.control_url()?;

        if let (Some(proto), Some(port)) = (proto, port) {
            return soap::delete_port_mapping(&control_url, proto, port).await;
        }

        let mappings = self.list_open_ports().await?;
        for m in mappings {
            if let Some(proto) = proto {
                if !m.protocol.eq_ignore_ascii_case(proto) {
                    continue;
                }
            }
            if let Err(e) = soap::delete_port_mapping(&control_url, &m.protocol, m.external_port).await {
                warn!(external_port = m.external_port, "failed to delete port mapping: {e:#}");
            }
        }
        Ok(())
    }
}

/// Finds a local, non-loopback IPv4 address on the same subnet as `peer`,
/// falling back to the first non-loopback interface address found. Used only
/// to log which interface discovery happened on; `open_port` maps every
/// non-loopback interface via `local_ipv4_addrs`, not just this one.
fn local_ip_relative_to(peer: std::net::SocketAddr) -> Result<IpAddr> {
    let peer_ip = match peer.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(Error::NoWanIpConnectionService),
    };

    let interfaces = if_addrs::get_if_addrs().map_err(Error::Send)?;
    let mut fallback = None;
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            let masked = |a: std::net::Ipv4Addr, mask: std::net::Ipv4Addr| u32::from(a) & u32::from(mask);
            if masked(v4.ip, v4.netmask) == masked(peer_ip, v4.netmask) {
                return Ok(IpAddr::V4(v4.ip));
            }
            fallback.get_or_insert(IpAddr::V4(v4.ip));
        }
    }
    fallback.ok_or(Error::NoWanIpConnectionService)
}

/// Every non-loopback IPv4 address bound to a local interface, in the order
/// `if_addrs` returns them (spec.md §4.1: `openPort` maps "every non-loopback
/// IPv4 local interface, sequentially").
fn local_ipv4_addrs() -> Result<Vec<std::net::Ipv4Addr>> {
    let interfaces = if_addrs::get_if_addrs().map_err(Error::Send)?;
    let addrs: Vec<_> = interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            if_addrs::IfAddr::V6(_) => None,
        })
        .collect();
    if addrs.is_empty() {
        return Err(Error::NoWanIpConnectionService);
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_have_sane_timeouts() {
        let opts = GatewayOptions::default();
        assert_eq!(opts.discover_timeout, Duration::from_secs(3));
        assert_eq!(opts.namespace, "cds");
    }

    #[tokio::test]
    async fn not_ready_before_discovery() {
        let gw = Gateway::new(GatewayOptions::default());
        assert!(matches!(gw.get_external_address().await, Err(Error::NotReady)));
        assert!(matches!(gw.open_port("tcp", 4001).await, Err(Error::NotReady)));
    }
}
