//! LAN peer discovery via mDNS/DNS-SD

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::store;

/// DNS-SD service type for SnapSync receivers.
pub const SERVICE_TYPE: &str = "_snapsync._tcp.local.";

/// One discovered SnapSync receiver.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub addresses: Vec<String>,
    pub port: u16,
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Peer {
    /// Time since this peer was last resolved.
    pub fn age(&self) -> Option<Duration> {
        self.last_seen.map(|seen| seen.elapsed())
    }

    /// Best-effort address for connecting, preferring private IPv4.
    pub fn preferred_address(&self) -> Option<String> {
        let parsed: Vec<(String, IpAddr)> = self
            .addresses
            .iter()
            .filter_map(|a| a.parse::<IpAddr>().ok().map(|ip| (a.clone(), ip)))
            .collect();
        for (addr, ip) in &parsed {
            if let IpAddr::V4(v4) = ip {
                let o = v4.octets();
                if o[0] == 10
                    || (o[0] == 172 && (16..=31).contains(&o[1]))
                    || (o[0] == 192 && o[1] == 168)
                {
                    return Some(addr.clone());
                }
            }
        }
        self.addresses.first().cloned()
    }
}

/// Active mDNS advertisement for a listening receiver.
///
/// Unregisters on `stop` or drop.
pub struct Advertiser {
    daemon: Option<ServiceDaemon>,
    fullname: String,
}

impl Advertiser {
    pub fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.unregister(&self.fullname);
            let _ = daemon.shutdown();
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start advertising a receiver at `port` under the SnapSync service type.
pub fn advertise(instance: &str, peer_id: &str, display_name: &str, port: u16) -> Result<Advertiser> {
    let daemon = ServiceDaemon::new().context("create mDNS daemon")?;
    let hostname = mdns_hostname();
    let ips = local_ips();
    let properties = [
        ("ver", "1"),
        ("id", peer_id),
        ("name", display_name),
        ("features", "direct"),
    ];
    let instance = sanitize_label(instance);
    let service = ServiceInfo::new(
        SERVICE_TYPE,
        &instance,
        &hostname,
        &ips[..],
        port,
        &properties[..],
    )
    .context("build mDNS service info")?;
    let fullname = service.get_fullname().to_string();
    daemon
        .register(service)
        .with_context(|| format!("register mDNS service {fullname}"))?;
    Ok(Advertiser {
        daemon: Some(daemon),
        fullname,
    })
}

/// Browse for SnapSync receivers until `timeout` elapses.
pub fn browse(timeout: Duration) -> Result<Vec<Peer>> {
    let daemon = ServiceDaemon::new().context("create mDNS daemon")?;
    let events = daemon.browse(SERVICE_TYPE).context("browse mDNS")?;

    let deadline = Instant::now() + timeout;
    let mut seen: HashMap<String, Peer> = HashMap::new();
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let step = remaining.min(Duration::from_millis(200));
        match events.recv_timeout(step) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let peer = peer_from_service(&info);
                seen.insert(peer.id.clone(), peer);
            }
            Ok(_) => {}
            Err(_) => {}
        }
    }
    let _ = daemon.shutdown();
    Ok(seen.into_values().collect())
}

/// Resolve one peer by its advertised id.
pub fn resolve_by_id(id: &str, timeout: Duration) -> Result<Option<Peer>> {
    let peers = browse(timeout)?;
    Ok(peers.into_iter().find(|p| p.id == id))
}

/// Stable local peer id, persisted across runs.
pub fn local_peer_id() -> Result<String> {
    store::load_or_create_peer_id(|| {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        let ips = local_ips()
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let seed = if host.is_empty() && ips.is_empty() {
            // No stable hardware identity to derive from.
            format!(
                "{}|{}",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or_default()
            )
        } else {
            format!("{host}|{ips}")
        };
        Ok(make_peer_id(&seed))
    })
}

/// Short hex id derived from a seed string.
pub fn make_peer_id(seed: &str) -> String {
    let mut h = Sha256::new();
    h.update(seed.trim().as_bytes());
    let digest = h.finalize();
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()[..12]
        .to_string()
}

fn peer_from_service(info: &ServiceInfo) -> Peer {
    let mut id = String::new();
    let mut name = String::new();
    for property in info.get_properties().iter() {
        match property.key() {
            "id" => id = property.val_str().to_string(),
            "name" => name = property.val_str().to_string(),
            _ => {}
        }
    }
    if id.is_empty() {
        id = info.get_fullname().to_string();
    }
    if name.is_empty() {
        name = info.get_hostname().to_string();
    }
    let mut addresses: Vec<String> = info
        .get_addresses()
        .iter()
        .map(|ip| ip.to_string())
        .collect();
    addresses.sort();
    Peer {
        id,
        name,
        addresses,
        port: info.get_port(),
        last_seen: Some(Instant::now()),
    }
}

/// Order peers most recently seen first.
pub fn sort_by_freshness(peers: &mut [Peer]) {
    peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
}

/// Local non-loopback, non-link-local IPv4 addresses.
fn local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return ips;
    };
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        if let IpAddr::V4(v4) = iface.ip() {
            let o = v4.octets();
            if o[0] == 169 && o[1] == 254 {
                continue;
            }
            ips.push(IpAddr::V4(v4));
        }
    }
    ips
}

fn mdns_hostname() -> String {
    let mut name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "snapsync-host".into());
    if !name.ends_with(".local.") {
        name = name.trim_end_matches('.').to_string();
        name.push_str(".local.");
    }
    name
}

fn sanitize_label(v: &str) -> String {
    let v = v.trim();
    if v.is_empty() {
        return "snapsync".to_string();
    }
    v.replace('.', "-")
}
