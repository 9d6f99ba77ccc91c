use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::info;

use crate::command::{CommandError, exec, exec_exists_ok};
use crate::network::subnet::Subnet;

/// Set once the bridge, gateway IP, forwarding, and NAT rule are in place.
static BRIDGE_READY: AtomicBool = AtomicBool::new(false);

/// Serializes first-time setup across tasks.
static BRIDGE_SETUP: Mutex<()> = Mutex::const_new(());

/// Ensure the host bridge exists and routes the guest subnet.
///
/// Idempotent: pre-existing bridge, address, and NAT rule states all pass.
/// Fast path is a single atomic load once setup has succeeded; failures
/// leave the flag unset so the next caller retries.
pub(crate) async fn ensure_bridge(name: &str, subnet: &Subnet) -> Result<(), CommandError> {
    if BRIDGE_READY.load(Ordering::Acquire) {
        return Ok(());
    }

    let _guard = BRIDGE_SETUP.lock().await;
    if BRIDGE_READY.load(Ordering::Acquire) {
        return Ok(());
    }

    setup_bridge(name, subnet).await?;
    BRIDGE_READY.store(true, Ordering::Release);
    info!(bridge = %name, subnet = %subnet.cidr(), "bridge ready");
    Ok(())
}

async fn setup_bridge(name: &str, subnet: &Subnet) -> Result<(), CommandError> {
    let gateway = format!("{}/{}", subnet.gateway(), subnet.prefix);
    let cidr = subnet.cidr();

    exec_exists_ok("ip", &["link", "add", name, "type", "bridge"]).await?;
    exec_exists_ok("ip", &["addr", "add", &gateway, "dev", name]).await?;
    exec("ip", &["link", "set", name, "up"]).await?;
    exec("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;

    // NAT masquerade for guest traffic leaving the subnet; probe with -C so
    // repeated setup never stacks duplicate rules.
    let rule: [&str; 8] = ["POSTROUTING", "-s", &cidr, "!", "-o", name, "-j", "MASQUERADE"];
    let mut check = vec!["-t", "nat", "-C"];
    check.extend_from_slice(&rule);
    if exec("iptables", &check).await.is_err() {
        let mut add = vec!["-t", "nat", "-A"];
        add.extend_from_slice(&rule);
        exec("iptables", &add).await?;
    }

    Ok(())
}
