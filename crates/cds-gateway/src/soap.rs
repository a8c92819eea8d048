use serde::Deserialize;
use url::Url;

use crate::description::WAN_IP_CONNECTION;
use crate::error::{Error, Result, SoapFault};

fn envelope(action: &str, params: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:{action} xmlns:u="{WAN_IP_CONNECTION}">{params}</u:{action}>
</s:Body>
</s:Envelope>"#
    )
}

#[derive(Debug, Deserialize)]
struct UPnPError {
    #[serde(rename = "errorCode")]
    error_code: u16,
    #[serde(rename = "errorDescription", default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
struct FaultDetail {
    #[serde(rename = "UPnPError")]
    upnp_error: UPnPError,
}

#[derive(Debug, Deserialize)]
struct Fault {
    detail: FaultDetail,
}

#[derive(Debug, Deserialize)]
struct FaultBody {
    #[serde(rename = "Fault")]
    fault: Fault,
}

#[derive(Debug, Deserialize)]
struct FaultEnvelope {
    #[serde(rename = "Body")]
    body: FaultBody,
}

fn parse_fault(body: &str) -> Option<SoapFault> {
    let envelope: FaultEnvelope = quick_xml::de::from_str(body).ok()?;
    let e = envelope.body.fault.detail.upnp_error;
    Some(SoapFault {
        code: e.error_code,
        description: e.error_description,
    })
}

/// POST a SOAP action to `control_url` and return the raw XML response body.
///
/// Implements the error model in spec.md §4.1 / §7: a 500 response carrying a
/// recognized `UPnPError` fault is surfaced as `Error::Fault`; any other
/// non-2xx status is fatal for the call.
async fn call(control_url: &Url, action: &str, params: &str) -> Result<String> {
    let body = envelope(action, params);
    let soap_action = format!("\"{WAN_IP_CONNECTION}#{action}\"");

    let client = reqwest::Client::new();
    let response = client
        .post(control_url.clone())
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header("SOAPACTION", soap_action)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::SoapRequest(e.into()))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| Error::SoapRequest(e.into()))?;

    if status.is_success() {
        return Ok(text);
    }

    if status.as_u16() == 500 {
        if let Some(fault) = parse_fault(&text) {
            return Err(Error::Fault(fault));
        }
    }

    Err(Error::UnexpectedStatus(status.as_u16()))
}

pub async fn get_external_ip_address(control_url: &Url) -> Result<std::net::Ipv4Addr> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(rename = "NewExternalIPAddress")]
        new_external_ip_address: String,
    }
    #[derive(Deserialize)]
    struct Body {
        #[serde(rename = "GetExternalIPAddressResponse")]
        response: Response,
    }
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(rename = "Body")]
        body: Body,
    }

    let text = call(control_url, "GetExternalIPAddress", "").await?;
    let envelope: Envelope =
        quick_xml::de::from_str(&text).map_err(|e| Error::ParseResponse(e.into()))?;
    envelope
        .body
        .response
        .new_external_ip_address
        .parse()
        .map_err(|e: std::net::AddrParseError| Error::ParseResponse(e.into()))
}

pub async fn add_port_mapping(
    control_url: &Url,
    proto: &str,
    external_port: u16,
    internal_client: std::net::IpAddr,
    internal_port: u16,
    description: &str,
) -> Result<()> {
    let params = format!(
        "<NewRemoteHost></NewRemoteHost>\
         <NewExternalPort>{external_port}</NewExternalPort>\
         <NewProtocol>{proto}</NewProtocol>\
         <NewInternalPort>{internal_port}</NewInternalPort>\
         <NewInternalClient>{internal_client}</NewInternalClient>\
         <NewEnabled>1</NewEnabled>\
         <NewPortMappingDescription>{description}</NewPortMappingDescription>\
         <NewLeaseDuration>0</NewLeaseDuration>"
    );
    call(control_url, "AddPortMapping", &params).await?;
    Ok(())
}

pub async fn delete_port_mapping(control_url: &Url, proto: &str, external_port: u16) -> Result<()> {
    let params = format!(
        "<NewRemoteHost></NewRemoteHost>\
         <NewExternalPort>{external_port}</NewExternalPort>\
         <NewProtocol>{proto}</NewProtocol>"
    );
    call(control_url, "DeletePortMapping", &params).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PortMappingEntry {
    pub external_port: u16,
    pub internal_port: u16,
    pub internal_client: String,
    pub protocol: String,
    pub description: String,
}

/// Returns `None` once the gateway faults with `errorCode 713` (spec.md §4.1).
pub async fn get_generic_port_mapping_entry(
    control_url: &Url,
    index: u32,
) -> Result<Option<PortMappingEntry>> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(rename = "NewExternalPort")]
        external_port: u16,
        #[serde(rename = "NewInternalPort")]
        internal_port: u16,
        #[serde(rename = "NewInternalClient")]
        internal_client: String,
        #[serde(rename = "NewProtocol")]
        protocol: String,
        #[serde(rename = "NewPortMappingDescription", default)]
        description: String,
    }
    #[derive(Deserialize)]
    struct Body {
        #[serde(rename = "GetGenericPortMappingEntryResponse")]
        response: Response,
    }
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(rename = "Body")]
        body: Body,
    }

    let params = format!("<NewPortMappingIndex>{index}</NewPortMappingIndex>");
    let result = call(control_url, "GetGenericPortMappingEntry", &params).await;

    match result {
        Ok(text) => {
            let envelope: Envelope =
                quick_xml::de::from_str(&text).map_err(|e| Error::ParseResponse(e.into()))?;
            let r = envelope.body.response;
            Ok(Some(PortMappingEntry {
                external_port: r.external_port,
                internal_port: r.internal_port,
                internal_client: r.internal_client,
                protocol: r.protocol,
                description: r.description,
            }))
        }
        Err(Error::Fault(f)) if f.is_end_of_mappings() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upnp_fault() {
        let body = r#"<?xml version="1.0"?>
        <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
        <s:Body><s:Fault>
        <faultcode>s:Client</faultcode>
        <faultstring>UPnPError</faultstring>
        <detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
        <errorCode>713</errorCode>
        <errorDescription>SpecifiedArrayIndexInvalid</errorDescription>
        </UPnPError></detail>
        </s:Fault></s:Body></s:Envelope>"#;
        let fault = parse_fault(body).unwrap();
        assert_eq!(fault.code, 713);
        assert!(fault.is_end_of_mappings());
    }

    #[test]
    fn builds_envelope_with_action_namespace() {
        let e = envelope("GetExternalIPAddress", "");
        assert!(e.contains("<u:GetExternalIPAddress xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">"));
        assert!(e.contains("</u:GetExternalIPAddress>"));
    }
}
