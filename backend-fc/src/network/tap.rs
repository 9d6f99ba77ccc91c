use sha2::{Digest, Sha256};

use crate::command::{CommandError, exec, exec_ignore_errors};

/// First 6 characters of a VM id, used in device names (IFNAMSIZ is 16).
fn short_id(vm_id: &str) -> &str {
    vm_id.get(..6).unwrap_or(vm_id)
}

/// TAP device name for a VM: `nova-<first6>`.
pub(crate) fn tap_name(vm_id: &str) -> String {
    format!("nova-{}", short_id(vm_id))
}

/// Deterministic, locally administered guest MAC: `02:FC:00:xx:yy:zz`,
/// with the low bytes derived from the VM id.
pub(crate) fn guest_mac(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    format!("02:FC:00:{:02X}:{:02X}:{:02X}", digest[0], digest[1], digest[2])
}

/// Kernel boot args, including the guest IP configuration so no DHCP runs
/// in the guest.
pub(crate) fn boot_args(guest_ip: &str, gateway: &str, netmask: &str) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={guest_ip}::{gateway}:{netmask}::eth0:off"
    )
}

/// Create a TAP device attached to the bridge and bring it up.
pub(crate) async fn create_tap(tap: &str, bridge: &str) -> Result<(), CommandError> {
    exec("ip", &["tuntap", "add", tap, "mode", "tap"]).await?;
    exec("ip", &["link", "set", tap, "master", bridge]).await?;
    exec("ip", &["link", "set", tap, "up"]).await?;
    Ok(())
}

/// Delete a TAP device, tolerating its absence.
pub(crate) async fn delete_tap(tap: &str) {
    exec_ignore_errors("ip", &["link", "del", tap]).await;
}
