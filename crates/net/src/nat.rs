//! UPnP port mapping for NAT-assisted hosting
//!
//! Minimal IGD client: SSDP discovery over UDP multicast, one fetch of the
//! device description, then SOAP calls against the WAN connection service.
//! Every step is bounded by a timeout. Failure is expected on many networks
//! and callers fall back to LAN-only hosting.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const SSDP_ADDR: &str = "239.255.255.250:1900";

const SSDP_SEARCH: &str = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 2\r\n\
ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
\r\n";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_TIMEOUT: Duration = Duration::from_secs(3);

/// WAN services that can hold port mappings, in order of preference
const WAN_SERVICES: &[&str] = &[
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANIPConnection:2",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// Public services that echo the caller's address as plain text
pub const IP_ECHO_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://icanhazip.com",
    "https://ifconfig.me/ip",
    "https://ident.me",
];

const MAPPING_DESCRIPTION: &str = "skillsync";

/// A gateway's port-mapping endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub control_url: String,
    pub service_type: String,
}

/// An active TCP port mapping
#[derive(Debug)]
pub struct PortMapping {
    gateway: Gateway,
    port: u16,
    local_ip: Ipv4Addr,
    external_ip: Option<Ipv4Addr>,
    http: reqwest::Client,
}

impl PortMapping {
    /// Forward `port` on the gateway to `port` on this machine
    ///
    /// Every failure comes back as `PortMappingFailed`.
    pub async fn create(port: u16) -> Result<Self> {
        match Self::negotiate(port).await {
            Ok(mapping) => Ok(mapping),
            Err(Error::PortMappingFailed(reason)) => Err(Error::PortMappingFailed(reason)),
            Err(e) => Err(Error::PortMappingFailed(e.to_string())),
        }
    }

    async fn negotiate(port: u16) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        let location = discover_location().await?;
        let gateway = describe_gateway(&http, &location).await?;
        let local_ip = local_ipv4().await;
        debug!(control = %gateway.control_url, local_ip = %local_ip, "Found WAN service");

        // Clear out a stale mapping from an earlier run
        let _ = soap_call(
            &http,
            &gateway,
            "DeletePortMapping",
            &delete_args(port),
        )
        .await;

        let args = [
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", port.to_string()),
            ("NewProtocol", "TCP".to_string()),
            ("NewInternalPort", port.to_string()),
            ("NewInternalClient", local_ip.to_string()),
            ("NewEnabled", "1".to_string()),
            ("NewPortMappingDescription", MAPPING_DESCRIPTION.to_string()),
            ("NewLeaseDuration", "0".to_string()),
        ];
        soap_call(&http, &gateway, "AddPortMapping", &args).await?;

        let external_ip = match soap_call(&http, &gateway, "GetExternalIPAddress", &[]).await {
            Ok(body) => extract_tag(&body, "NewExternalIPAddress").and_then(|s| s.parse().ok()),
            Err(e) => {
                debug!(error = %e, "Gateway did not report an external address");
                None
            }
        };
        let external_ip = match external_ip {
            Some(ip) => Some(ip),
            None => external_ip_from_echo(&http).await,
        };

        info!(port, external_ip = ?external_ip, "Port mapping added");
        Ok(Self {
            gateway,
            port,
            local_ip,
            external_ip,
            http,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Address other networks should connect to
    pub fn external_ip(&self) -> Option<Ipv4Addr> {
        self.external_ip
    }

    /// Delete the mapping from the gateway
    pub async fn remove(self) -> Result<()> {
        soap_call(
            &self.http,
            &self.gateway,
            "DeletePortMapping",
            &delete_args(self.port),
        )
        .await?;
        info!(port = self.port, "Port mapping removed");
        Ok(())
    }
}

fn delete_args(port: u16) -> [(&'static str, String); 3] {
    [
        ("NewRemoteHost", String::new()),
        ("NewExternalPort", port.to_string()),
        ("NewProtocol", "TCP".to_string()),
    ]
}

/// This machine's LAN address, as used for the default route
///
/// Connecting a UDP socket sends nothing; it only selects the interface.
pub async fn local_ipv4() -> Ipv4Addr {
    async fn local_route() -> std::io::Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(("8.8.8.8", 80)).await?;
        match socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(*addr.ip()),
            SocketAddr::V6(_) => Ok(Ipv4Addr::LOCALHOST),
        }
    }

    match local_route().await {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => Ipv4Addr::LOCALHOST,
        Err(e) => {
            debug!(error = %e, "No default route, using loopback");
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Ask public echo services for our address, first answer wins
pub async fn external_ip_from_echo(http: &reqwest::Client) -> Option<Ipv4Addr> {
    for url in IP_ECHO_SERVICES {
        let text = match http.get(*url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await,
            Ok(resp) => {
                debug!(url, status = %resp.status(), "Echo service refused");
                continue;
            }
            Err(e) => {
                debug!(url, error = %e, "Echo service unreachable");
                continue;
            }
        };
        if let Ok(Ok(ip)) = text.map(|t| t.trim().parse::<Ipv4Addr>()) {
            debug!(url, ip = %ip, "External address from echo service");
            return Some(ip);
        }
    }
    warn!("Could not determine external address");
    None
}

/// Multicast an SSDP search and return the first gateway LOCATION
async fn discover_location() -> Result<String> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.send_to(SSDP_SEARCH.as_bytes(), SSDP_ADDR).await?;

    let deadline = Instant::now() + DISCOVERY_TIMEOUT;
    let mut buf = [0u8; 2048];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (n, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::PortMappingFailed(
                    "No UPnP gateway answered".into(),
                ))
            }
        };
        let response = String::from_utf8_lossy(&buf[..n]);
        if let Some(location) = parse_ssdp_location(&response) {
            debug!(from = %from, location = %location, "SSDP response");
            return Ok(location);
        }
    }
}

/// Fetch the device description and pick a WAN connection service
async fn describe_gateway(http: &reqwest::Client, location: &str) -> Result<Gateway> {
    let xml = http.get(location).send().await?.text().await?;
    find_wan_service(&xml, location).ok_or_else(|| {
        Error::PortMappingFailed("Gateway has no WAN connection service".into())
    })
}

async fn soap_call(
    http: &reqwest::Client,
    gateway: &Gateway,
    action: &str,
    args: &[(&str, String)],
) -> Result<String> {
    let body = soap_envelope(&gateway.service_type, action, args);
    let resp = http
        .post(&gateway.control_url)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header(
            "SOAPAction",
            format!("\"{}#{}\"", gateway.service_type, action),
        )
        .body(body)
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        let detail = extract_tag(&text, "errorDescription").unwrap_or_else(|| status.to_string());
        return Err(Error::PortMappingFailed(format!("{}: {}", action, detail)));
    }
    Ok(text)
}

pub(crate) fn parse_ssdp_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("location")
            .then(|| value.trim().to_string())
    })
}

pub(crate) fn find_wan_service(xml: &str, location: &str) -> Option<Gateway> {
    for wanted in WAN_SERVICES {
        for service in xml.split("<service>").skip(1) {
            let service = service.split("</service>").next().unwrap_or(service);
            if extract_tag(service, "serviceType").as_deref() != Some(*wanted) {
                continue;
            }
            let control = extract_tag(service, "controlURL")?;
            return Some(Gateway {
                control_url: resolve_url(location, &control),
                service_type: wanted.to_string(),
            });
        }
    }
    None
}

/// Resolve a control path against the description URL
pub(crate) fn resolve_url(location: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    match reqwest::Url::parse(location).and_then(|base| base.join(path)) {
        Ok(url) => url.to_string(),
        Err(_) => path.to_string(),
    }
}

/// Text of the first `<tag>` element, ignoring namespace prefixes
pub(crate) fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let mut rest = xml;
    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let end = rest.find('>')?;
        let name = rest[..end].split_whitespace().next().unwrap_or("");
        let local = name.rsplit(':').next().unwrap_or(name);
        if local == tag {
            let body = &rest[end + 1..];
            let close = body.find("</")?;
            return Some(body[..close].trim().to_string());
        }
    }
    None
}

pub(crate) fn soap_envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut params = String::new();
    for (name, value) in args {
        params.push_str(&format!("<{name}>{value}</{name}>"));
    }
    format!(
        "<?xml version=\"1.0\"?>\
<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
<s:Body><u:{action} xmlns:u=\"{service_type}\">{params}</u:{action}></s:Body>\
</s:Envelope>"
    )
}
