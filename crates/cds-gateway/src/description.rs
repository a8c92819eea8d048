use serde::Deserialize;

/// Mirrors the subset of the IGDv1 device description XML we need to walk
/// down to the `WANIPConnection` service's control URL (spec.md §4.1).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RootDesc {
    pub device: Device,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Device {
    #[serde(rename = "deviceType", default)]
    pub device_type: String,
    #[serde(rename = "serviceList", default)]
    pub service_list: ServiceList,
    #[serde(rename = "deviceList", default)]
    pub device_list: DeviceList,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DeviceList {
    #[serde(rename = "device", default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServiceList {
    #[serde(rename = "service", default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Service {
    #[serde(rename = "serviceType")]
    pub service_type: String,
    #[serde(rename = "controlURL")]
    pub control_url: String,
}

pub const WAN_IP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

impl Device {
    /// Depth-first walk for a service whose type matches `WANIPConnection:1`,
    /// as spec.md §4.1 requires.
    pub fn find_wan_ip_control_url(&self) -> Option<&str> {
        for svc in &self.service_list.services {
            if svc.service_type == WAN_IP_CONNECTION {
                return Some(&svc.control_url);
            }
        }
        for child in &self.device_list.devices {
            if let Some(url) = child.find_wan_ip_control_url() {
                return Some(url);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    <root xmlns="urn:schemas-upnp-org:device-1-0">
      <device>
        <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
            <deviceList>
              <device>
                <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
                <serviceList>
                  <service>
                    <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                    <controlURL>/upnp/control/WANIPConnection0</controlURL>
                  </service>
                </serviceList>
              </device>
            </deviceList>
          </device>
        </deviceList>
      </device>
    </root>
    "#;

    #[test]
    fn walks_nested_devices_to_find_control_url() {
        let root: RootDesc = quick_xml::de::from_str(SAMPLE).unwrap();
        assert_eq!(
            root.device.find_wan_ip_control_url(),
            Some("/upnp/control/WANIPConnection0")
        );
    }
}
