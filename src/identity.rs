//! Stable per-device client identity derived from the hardware address.

use std::path::Path;

use tracing::{debug, warn};

const NET_CLASS: &str = "/sys/class/net";
const MACHINE_ID: &str = "/etc/machine-id";
const FALLBACK_ID: &str = "miniplayer";

/// Turns `aa:bb:cc:dd:ee:ff` into `0xaabbccddeeff`, leading zeros dropped.
///
/// All-zero addresses (loopback, some virtual links) yield `None`.
pub fn format_mac(address: &str) -> Option<String> {
    let octets: Vec<&str> = address.trim().split(':').collect();
    if octets.len() != 6 {
        return None;
    }
    let mut value: u64 = 0;
    for octet in octets {
        if octet.len() != 2 {
            return None;
        }
        value = (value << 8) | u64::from(u8::from_str_radix(octet, 16).ok()?);
    }
    (value != 0).then(|| format!("{:#x}", value))
}

async fn first_hardware_address(net_class: &Path) -> Option<String> {
    let mut entries = tokio::fs::read_dir(net_class).await.ok()?;
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    for name in names.iter().filter(|name| name.as_str() != "lo") {
        let path = net_class.join(name).join("address");
        match tokio::fs::read_to_string(&path).await {
            Ok(address) => {
                if let Some(id) = format_mac(&address) {
                    debug!("Using hardware address of {}", name);
                    return Some(id);
                }
            }
            Err(e) => debug!("Skipping {}: {}", path.display(), e),
        }
    }
    None
}

async fn machine_id(path: &Path) -> Option<String> {
    let id = tokio::fs::read_to_string(path).await.ok()?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Resolves the client identity, preferring the first non-loopback NIC.
pub async fn client_identity() -> String {
    resolve(Path::new(NET_CLASS), Path::new(MACHINE_ID)).await
}

async fn resolve(net_class: &Path, machine_id_path: &Path) -> String {
    if let Some(id) = first_hardware_address(net_class).await {
        return id;
    }
    if let Some(id) = machine_id(machine_id_path).await {
        warn!("No hardware address found, falling back to machine id");
        return id;
    }
    warn!("No stable identity available, using {}", FALLBACK_ID);
    FALLBACK_ID.to_string()
}
