//! LAN peer discovery over mDNS.
//!
//! Devices advertise `_weft-sync._tcp.local.` with their device id and
//! display name in the TXT record. A discovery window browses for that
//! service type, collects resolved peers, and returns whatever arrived
//! when the window closes. An empty LAN yields an empty list, not an
//! error.

use crate::error::{SyncError, SyncResult};
use crate::model::DiscoveredPeer;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use weft_types::DeviceId;

/// mDNS service type for sync listeners.
pub const SERVICE_TYPE: &str = "_weft-sync._tcp.local.";

fn mdns_err(context: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Io(std::io::Error::other(format!("{context}: {e}")))
}

/// A registered mDNS advertisement; dropping it unregisters the
/// service.
pub struct Advertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Advertisement {
    /// Full mDNS service name of this advertisement.
    #[must_use]
    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!("mdns unregister failed: {e}");
        }
        let _ = self.daemon.shutdown();
    }
}

/// Advertises this device's sync listener on the LAN.
pub fn advertise(
    device_id: DeviceId,
    display_name: &str,
    port: u16,
) -> SyncResult<Advertisement> {
    let daemon = ServiceDaemon::new().map_err(|e| mdns_err("mdns daemon", e))?;

    let instance = device_id.to_string();
    let hostname = format!("{instance}.local.");
    let properties: HashMap<String, String> = HashMap::from([
        ("id".to_string(), instance.clone()),
        ("name".to_string(), display_name.to_string()),
    ]);

    let service = ServiceInfo::new(
        SERVICE_TYPE,
        &instance,
        &hostname,
        "",
        port,
        Some(properties),
    )
    .map_err(|e| mdns_err("mdns service info", e))?
    .enable_addr_auto();

    let fullname = service.get_fullname().to_string();
    daemon
        .register(service)
        .map_err(|e| mdns_err("mdns register", e))?;

    debug!(%fullname, port, "advertising sync service");
    Ok(Advertisement { daemon, fullname })
}

/// Browses the LAN for sync peers until the window elapses.
///
/// Results are deduplicated by device id (latest resolution wins), the
/// local device is filtered out, and records without a parseable id
/// are skipped. An elapsed window returns whatever was collected.
pub async fn discover(
    local_device: DeviceId,
    window: Duration,
) -> SyncResult<Vec<DiscoveredPeer>> {
    let daemon = ServiceDaemon::new().map_err(|e| mdns_err("mdns daemon", e))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| mdns_err("mdns browse", e))?;

    let deadline = Instant::now() + window;
    let mut found: HashMap<DeviceId, DiscoveredPeer> = HashMap::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, receiver.recv_async()).await {
            Err(_) => break,
            Ok(Err(_)) => break,
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                if let Some(peer) = parse_resolved(&info, local_device) {
                    debug!(peer = %peer.device_id.short(), name = %peer.display_name, "resolved peer");
                    found.insert(peer.device_id, peer);
                }
            }
            Ok(Ok(_)) => {}
        }
    }

    if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
        debug!("mdns stop_browse failed: {e}");
    }
    let _ = daemon.shutdown();

    let mut peers: Vec<DiscoveredPeer> = found.into_values().collect();
    peers.sort_by_key(|p| p.device_id);
    Ok(peers)
}

/// Extracts a peer from a resolved service record.
fn parse_resolved(info: &ServiceInfo, local_device: DeviceId) -> Option<DiscoveredPeer> {
    let id_str = info.get_property_val_str("id")?;
    let device_id = match id_str.parse::<DeviceId>() {
        Ok(id) => id,
        Err(e) => {
            warn!(fullname = %info.get_fullname(), "discarding record with bad id: {e}");
            return None;
        }
    };
    if device_id == local_device {
        return None;
    }

    let display_name = info
        .get_property_val_str("name")
        .unwrap_or(id_str)
        .to_string();
    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort();

    Some(DiscoveredPeer {
        device_id,
        display_name,
        addresses,
        port: info.get_port(),
    })
}

/// Best local address to hand to peers when the listener is bound to
/// the wildcard address.
pub(crate) fn advertised_ip(bound: IpAddr) -> IpAddr {
    if !bound.is_unspecified() {
        return bound;
    }
    // Routing probe; UDP connect sends no packets.
    if let Ok(socket) = std::net::UdpSocket::bind(("0.0.0.0", 0)) {
        if socket.connect(("8.8.8.8", 80)).is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip();
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(id: &str, name: &str, port: u16) -> ServiceInfo {
        let properties: HashMap<String, String> = HashMap::from([
            ("id".to_string(), id.to_string()),
            ("name".to_string(), name.to_string()),
        ]);
        ServiceInfo::new(
            SERVICE_TYPE,
            id,
            &format!("{id}.local."),
            "192.168.1.40",
            port,
            Some(properties),
        )
        .unwrap()
    }

    #[test]
    fn resolved_record_parses_into_a_peer() {
        let device = DeviceId::new();
        let info = make_info(&device.to_string(), "Desk Laptop", 7465);

        let peer = parse_resolved(&info, DeviceId::new()).unwrap();
        assert_eq!(peer.device_id, device);
        assert_eq!(peer.display_name, "Desk Laptop");
        assert_eq!(peer.port, 7465);
        assert_eq!(peer.addresses, vec!["192.168.1.40".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn own_advertisement_is_filtered_out() {
        let device = DeviceId::new();
        let info = make_info(&device.to_string(), "Self", 7465);
        assert!(parse_resolved(&info, device).is_none());
    }

    #[test]
    fn records_with_unparseable_ids_are_skipped() {
        let info = make_info("not-a-uuid", "Junk", 7465);
        assert!(parse_resolved(&info, DeviceId::new()).is_none());
    }

    #[test]
    fn explicit_bind_address_is_advertised_verbatim() {
        let bound: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(advertised_ip(bound), bound);
    }
}
