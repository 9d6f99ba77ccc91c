use backend::{IsolationMode, NetRule, NetworkPolicy};
use tracing::{error, info};

use crate::command::{CommandError, exec, exec_ignore_errors};
use crate::network::subnet::Subnet;

/// Peer-side veth device name inside the namespace (fixed).
const PEER_DEVICE: &str = "veth0";

/// Network namespace name for a VM: `nova-<vmid>`.
pub(crate) fn netns_name(vm_id: &str) -> String {
    format!("nova-{vm_id}")
}

/// Host-side veth device name: `nova-ve-<first6>`.
fn veth_host_name(vm_id: &str) -> String {
    format!("nova-ve-{}", vm_id.get(..6).unwrap_or(vm_id))
}

/// Run a command inside a namespace.
async fn ns_exec(ns: &str, program: &str, args: &[&str]) -> Result<String, CommandError> {
    let mut full = vec!["netns", "exec", ns, program];
    full.extend_from_slice(args);
    exec("ip", &full).await
}

/// Create an isolated network namespace for a VM: veth uplink to the
/// bridge, in-namespace TAP, default route, and the function's iptables
/// policy. Returns the namespace name.
///
/// Any failure tears down whatever was created before returning.
pub(crate) async fn setup_netns(
    vm_id: &str,
    tap: &str,
    guest_ip: &str,
    bridge: &str,
    subnet: &Subnet,
    policy: &NetworkPolicy,
) -> Result<String, CommandError> {
    let ns = netns_name(vm_id);
    let result = setup_netns_inner(&ns, vm_id, tap, guest_ip, bridge, subnet, policy).await;
    match result {
        Ok(()) => {
            info!(netns = %ns, "namespace ready");
            Ok(ns)
        }
        Err(e) => {
            error!(netns = %ns, error = %e, "namespace setup failed, cleaning up");
            teardown_netns(vm_id).await;
            Err(e)
        }
    }
}

async fn setup_netns_inner(
    ns: &str,
    vm_id: &str,
    tap: &str,
    guest_ip: &str,
    bridge: &str,
    subnet: &Subnet,
    policy: &NetworkPolicy,
) -> Result<(), CommandError> {
    let host_veth = veth_host_name(vm_id);
    let gateway = subnet.gateway().to_string();
    let peer_addr = format!("{guest_ip}/{}", subnet.prefix);

    exec("ip", &["netns", "add", ns]).await?;

    // Veth uplink: host end on the bridge, peer end inside the namespace.
    exec(
        "ip",
        &["link", "add", &host_veth, "type", "veth", "peer", "name", PEER_DEVICE, "netns", ns],
    )
    .await?;
    exec("ip", &["link", "set", &host_veth, "master", bridge]).await?;
    exec("ip", &["link", "set", &host_veth, "up"]).await?;
    ns_exec(ns, "ip", &["addr", "add", &peer_addr, "dev", PEER_DEVICE]).await?;
    ns_exec(ns, "ip", &["link", "set", PEER_DEVICE, "up"]).await?;
    ns_exec(ns, "ip", &["link", "set", "lo", "up"]).await?;

    // The VM's TAP lives inside the namespace.
    ns_exec(ns, "ip", &["tuntap", "add", tap, "mode", "tap"]).await?;
    ns_exec(ns, "ip", &["link", "set", tap, "up"]).await?;

    ns_exec(ns, "ip", &["route", "add", "default", "via", &gateway]).await?;

    // IPv6 is dropped wholesale; the policy language is IPv4-only.
    for chain in ["INPUT", "OUTPUT", "FORWARD"] {
        ns_exec(ns, "ip6tables", &["-P", chain, "DROP"]).await?;
    }

    for rule in policy_rules(&gateway, policy) {
        let args: Vec<&str> = rule.iter().map(String::as_str).collect();
        ns_exec(ns, "iptables", &args).await?;
    }

    Ok(())
}

/// Delete a VM's namespace and its host-side veth (removing the peer).
pub(crate) async fn teardown_netns(vm_id: &str) {
    let ns = netns_name(vm_id);
    exec_ignore_errors("ip", &["link", "del", &veth_host_name(vm_id)]).await;
    exec_ignore_errors("ip", &["netns", "del", &ns]).await;
}

/// Build the iptables argument lists for a function's policy, in apply
/// order.
fn policy_rules(gateway: &str, policy: &NetworkPolicy) -> Vec<Vec<String>> {
    let mut rules = Vec::new();

    match policy.isolation_mode {
        Some(IsolationMode::Strict) => {
            rules.push(args(&["-P", "OUTPUT", "DROP"]));
            rules.push(args(&["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]));
            rules.push(args(&[
                "-A", "OUTPUT", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT",
            ]));
            rules.extend(dns_rules(gateway));
        }
        Some(IsolationMode::EgressOnly) => {
            rules.push(args(&["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]));
            for private in ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"] {
                rules.push(args(&["-A", "OUTPUT", "-d", private, "-j", "ACCEPT"]));
            }
            rules.extend(dns_rules(gateway));
            rules.push(args(&["-P", "OUTPUT", "DROP"]));
        }
        None => {}
    }

    for rule in &policy.egress_rules {
        rules.push(allow_rule("OUTPUT", "-d", rule));
    }

    if !policy.ingress_rules.is_empty() {
        rules.push(args(&["-P", "INPUT", "DROP"]));
        rules.push(args(&["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"]));
        rules.push(args(&[
            "-A", "INPUT", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT",
        ]));
        rules.push(args(&["-A", "INPUT", "-s", gateway, "-j", "ACCEPT"]));
        for rule in &policy.ingress_rules {
            rules.push(allow_rule("INPUT", "-s", rule));
        }
    }

    rules
}

fn dns_rules(gateway: &str) -> Vec<Vec<String>> {
    ["udp", "tcp"]
        .into_iter()
        .map(|proto| {
            args(&[
                "-A", "OUTPUT", "-p", proto, "-d", gateway, "--dport", "53", "-j", "ACCEPT",
            ])
        })
        .collect()
}

fn allow_rule(chain: &str, direction: &str, rule: &NetRule) -> Vec<String> {
    vec![
        "-A".into(),
        chain.into(),
        direction.into(),
        rule.host.clone(),
        "-p".into(),
        rule.protocol.clone(),
        "--dport".into(),
        rule.port.to_string(),
        "-j".into(),
        "ACCEPT".into(),
    ]
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(host: &str, port: u16, proto: &str) -> NetRule {
        NetRule {
            host: host.into(),
            port,
            protocol: proto.into(),
        }
    }

    fn join(rule: &[String]) -> String {
        rule.join(" ")
    }

    #[test]
    fn names_fit_limits() {
        assert_eq!(netns_name("ab12cd34"), "nova-ab12cd34");
        assert_eq!(veth_host_name("ab12cd34"), "nova-ve-ab12cd");
        assert!(veth_host_name("ffffffffffffffff").len() < 16);
    }

    #[test]
    fn strict_policy_defaults_to_drop_with_dns() {
        let policy = NetworkPolicy {
            isolation_mode: Some(IsolationMode::Strict),
            egress_rules: vec![rule("93.184.216.34", 443, "tcp")],
            ingress_rules: vec![],
        };
        let rules: Vec<String> = policy_rules("172.30.0.1", &policy).iter().map(|r| join(r)).collect();

        assert_eq!(rules[0], "-P OUTPUT DROP");
        assert!(rules.contains(&"-A OUTPUT -o lo -j ACCEPT".to_string()));
        assert!(
            rules.contains(&"-A OUTPUT -p udp -d 172.30.0.1 --dport 53 -j ACCEPT".to_string())
        );
        assert_eq!(
            rules.last().map(String::as_str),
            Some("-A OUTPUT -d 93.184.216.34 -p tcp --dport 443 -j ACCEPT")
        );
    }

    #[test]
    fn egress_only_allows_private_ranges_then_drops() {
        let policy = NetworkPolicy {
            isolation_mode: Some(IsolationMode::EgressOnly),
            egress_rules: vec![],
            ingress_rules: vec![],
        };
        let rules: Vec<String> = policy_rules("172.30.0.1", &policy).iter().map(|r| join(r)).collect();

        assert!(rules.contains(&"-A OUTPUT -d 10.0.0.0/8 -j ACCEPT".to_string()));
        assert!(rules.contains(&"-A OUTPUT -d 172.16.0.0/12 -j ACCEPT".to_string()));
        assert!(rules.contains(&"-A OUTPUT -d 192.168.0.0/16 -j ACCEPT".to_string()));
        // Default policy lands after the accepts.
        assert_eq!(rules.last().map(String::as_str), Some("-P OUTPUT DROP"));
    }

    #[test]
    fn ingress_rules_imply_input_lockdown() {
        let policy = NetworkPolicy {
            isolation_mode: Some(IsolationMode::Strict),
            egress_rules: vec![],
            ingress_rules: vec![rule("10.1.2.3", 8080, "tcp")],
        };
        let rules: Vec<String> = policy_rules("172.30.0.1", &policy).iter().map(|r| join(r)).collect();

        assert!(rules.contains(&"-P INPUT DROP".to_string()));
        assert!(rules.contains(&"-A INPUT -s 172.30.0.1 -j ACCEPT".to_string()));
        assert!(
            rules.contains(&"-A INPUT -s 10.1.2.3 -p tcp --dport 8080 -j ACCEPT".to_string())
        );
    }

    #[test]
    fn no_ingress_rules_means_no_input_changes() {
        let policy = NetworkPolicy {
            isolation_mode: Some(IsolationMode::Strict),
            egress_rules: vec![],
            ingress_rules: vec![],
        };
        let rules = policy_rules("172.30.0.1", &policy);
        assert!(rules.iter().all(|r| !r.contains(&"INPUT".to_string())));
    }
}
