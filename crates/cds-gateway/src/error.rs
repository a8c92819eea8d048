use std::net::SocketAddr;

#[derive(Debug, Clone, thiserror::Error)]
#[error("SOAP fault {code}: {description}")]
pub struct SoapFault {
    pub code: u16,
    pub description: String,
}

impl SoapFault {
    /// `713 SpecifiedArrayIndexInvalid` — the sentinel the source uses to end
    /// `GetGenericPortMappingEntry` iteration (spec.md §4.1).
    pub fn is_end_of_mappings(&self) -> bool {
        self.code == 713
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SSDP discovery timed out after {0:?}")]
    DiscoveryTimeout(std::time::Duration),
    #[error("no IGD responded to SSDP discovery")]
    NoGatewayFound,
    #[error("error sending SSDP search request: {0}")]
    Send(#[source] std::io::Error),
    #[error("malformed SSDP response from {addr}: {source}")]
    MalformedSsdpResponse {
        addr: SocketAddr,
        #[source]
        source: anyhow::Error,
    },
    #[error("error fetching device description from {url}: {source:#}")]
    FetchDescription {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("device description has no WANIPConnection service with a control URL")]
    NoWanIpConnectionService,
    #[error("error sending SOAP request: {0:#}")]
    SoapRequest(#[source] anyhow::Error),
    #[error("unexpected HTTP status {0} from SOAP request")]
    UnexpectedStatus(u16),
    #[error(transparent)]
    Fault(#[from] SoapFault),
    #[error("error parsing SOAP response: {0:#}")]
    ParseResponse(#[source] anyhow::Error),
    #[error("gateway not ready: call ready() first")]
    NotReady,
}

pub type Result<T> = std::result::Result<T, Error>;
