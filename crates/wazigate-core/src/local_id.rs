// Gateway identity: the first usable hardware address, separators removed.

use std::path::Path;

use tracing::{debug, warn};

const NET_CLASS: &str = "/sys/class/net";

/// Resolve the gateway id: `configured` if non-empty, else the first
/// hardware address under `/sys/class/net`, else a random id.
pub fn resolve(configured: Option<&str>) -> String {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_owned();
    }
    if let Some(id) = from_interfaces(Path::new(NET_CLASS)) {
        return id;
    }
    let id = random_id();
    warn!(local_id = %id, "no hardware address found, using a random gateway id");
    id
}

/// First non-empty, non-zero `address` of the interfaces under `dir`,
/// in interface name order.
pub fn from_interfaces(dir: &Path) -> Option<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    names.sort();

    names.into_iter().find_map(|iface| {
        let raw = std::fs::read_to_string(iface.join("address")).ok()?;
        let id = normalize(&raw)?;
        debug!(interface = %iface.display(), local_id = %id, "gateway id from hardware address");
        Some(id)
    })
}

fn normalize(address: &str) -> Option<String> {
    let id: String = address.trim().chars().filter(|c| *c != ':').collect();
    (!id.is_empty() && id.chars().any(|c| c != '0')).then_some(id)
}

fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_owned()
}
