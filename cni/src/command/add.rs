use std::io::Write;

use ipnet::IpNet;
use tracing::{info, instrument, warn};
use weft_config::Family;
use weft_devices::{NetworkInfo, BRIDGE_NAME};
use weft_ipam::PlugState;

use super::{write_json, CniCommand, Invocation};
use crate::{add_result::AddResult, Error};

pub struct AddCommand;

impl CniCommand for AddCommand {
    #[instrument(skip_all, fields(container_id = invocation.args.container_id.as_deref()))]
    fn run(&self, invocation: &Invocation<'_>, out: &mut dyn Write) -> Result<(), Error> {
        let args = invocation.args;
        let container_id = args.container_id()?;
        let netns = args.netns()?;
        let if_name = args.if_name()?;

        let conf = invocation.net_conf()?;
        let mut storage = Invocation::storage(&conf)?;

        let Leases {
            networks,
            gateways,
            fresh,
        } = storage.atomic_do(|state| allocate(state, container_id))?;
        info!(addrs = ?networks.iter().map(|n| n.addr).collect::<Vec<_>>(), ?fresh, "allocated");

        let wired = invocation
            .devices
            .ensure_bridge(BRIDGE_NAME, &gateways)
            .and_then(|_| {
                invocation
                    .devices
                    .setup_veth(netns, container_id, BRIDGE_NAME, if_name, &networks)
            });

        let link = match wired {
            Ok(link) => link,
            Err(err) => {
                // leases held before this call belong to a live interface
                if let Err(release_err) = storage.atomic_do(|state| {
                    release_families(state, container_id, &fresh);
                    Ok::<_, Error>(())
                }) {
                    warn!(%release_err, "failed to release addresses after setup failure");
                }
                return Err(err.into());
            }
        };

        write_json(out, &AddResult::new(&conf.cni_version, link, &networks))
    }
}

struct Leases {
    networks: Vec<NetworkInfo>,
    gateways: Vec<IpNet>,
    /// Families whose address was leased by this call.
    fresh: Vec<Family>,
}

/// Leases one address per enabled family, all or nothing.
fn allocate(state: &mut PlugState, container_id: &str) -> Result<Leases, Error> {
    let families = state.enabled().collect::<Vec<_>>();
    if families.is_empty() {
        return Err(Error::InvalidNetConf("no address family configured".into()));
    }

    let mut networks = Vec::with_capacity(families.len());
    let mut gateways = Vec::with_capacity(families.len());
    let mut fresh = Vec::with_capacity(families.len());

    for family in families {
        let Some(family_state) = state.family_mut(family) else {
            continue;
        };
        let record = &mut family_state.record;
        let held = record.get_by_id(container_id).is_some();

        match record.alloc(container_id) {
            Ok(addr) => {
                if !held {
                    fresh.push(family);
                }
                networks.push(NetworkInfo {
                    addr,
                    gateway: record.gateway().addr(),
                    cluster_cidr: family_state.config.cluster_cidr,
                });
                gateways.push(record.gateway());
            }
            Err(err) => {
                release_families(state, container_id, &fresh);
                return Err(err.into());
            }
        }
    }

    Ok(Leases {
        networks,
        gateways,
        fresh,
    })
}

pub(super) fn release(state: &mut PlugState, container_id: &str) {
    let families = state.enabled().collect::<Vec<_>>();
    release_families(state, container_id, &families);
}

fn release_families(state: &mut PlugState, container_id: &str, families: &[Family]) {
    for family in families {
        if let Some(family_state) = state.family_mut(*family) {
            family_state.record.release(container_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::Value;
    use weft_devices::testing::Call;

    use super::*;
    use crate::{command::tests::Node, Command};

    #[test]
    fn add_allocates_and_wires() {
        let node = Node::new("10.244.0.0/16", "10.244.1.0/24");

        let out = node.run(&node.args(Command::Add, "abc")).unwrap();
        let result: Value = serde_json::from_str(&out).unwrap();

        assert_eq!(result["cniVersion"], "1.0.0");
        let address = result["ips"][0]["address"].as_str().unwrap();
        let address: IpNet = address.parse().unwrap();
        assert!("10.244.1.0/24".parse::<IpNet>().unwrap().contains(&address));
        assert_eq!(address.prefix_len(), 24);
        assert_eq!(result["ips"][0]["gateway"], "10.244.1.1");
        assert_eq!(result["interfaces"][1]["name"], "eth0");

        let calls = node.devices.calls();
        assert_eq!(
            calls[0],
            Call::EnsureBridge {
                name: BRIDGE_NAME.into(),
                gateways: vec!["10.244.1.1/24".parse().unwrap()],
            }
        );
        assert_eq!(
            calls[1],
            Call::SetupVeth {
                container_id: "abc".into(),
                if_name: "eth0".into(),
                addrs: vec![address],
            }
        );
    }

    #[test]
    fn repeated_add_keeps_address() {
        let node = Node::new("10.244.0.0/16", "10.244.1.0/24");
        let args = node.args(Command::Add, "abc");

        let first: Value = serde_json::from_str(&node.run(&args).unwrap()).unwrap();
        let second: Value = serde_json::from_str(&node.run(&args).unwrap()).unwrap();

        assert_eq!(first["ips"], second["ips"]);
    }

    #[test]
    fn dual_stack_add() {
        let node = Node::new(
            "10.244.0.0/16,fd00:10:244::/56",
            "10.244.1.0/24,fd00:10:244:1::/64",
        );

        let out = node.run(&node.args(Command::Add, "abc")).unwrap();
        let result: Value = serde_json::from_str(&out).unwrap();

        let ips = result["ips"].as_array().unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[1]["gateway"], "fd00:10:244:1::1");
        assert_eq!(result["routes"].as_array().unwrap().len(), 4);
        assert_eq!(result["routes"][2]["dst"], "::/0");
    }

    #[test]
    fn exhaustion_is_try_again_later() {
        let node = Node::new("10.244.0.0/16", "10.244.1.0/29");

        let addrs = (0..5)
            .map(|i| {
                let out = node.run(&node.args(Command::Add, &format!("c{i}"))).unwrap();
                let result: Value = serde_json::from_str(&out).unwrap();
                result["ips"][0]["address"].as_str().unwrap().to_owned()
            })
            .collect::<HashSet<_>>();
        assert_eq!(addrs.len(), 5);

        let err = node.run(&node.args(Command::Add, "c5")).unwrap_err();
        assert_eq!(err.code(), 11);
    }

    #[test]
    fn failed_setup_releases_addresses() {
        let node = Node::new("10.244.0.0/16", "10.244.1.0/30");
        node.devices.fail("setup_veth");

        let err = node.run(&node.args(Command::Add, "abc")).unwrap_err();
        assert_eq!(err.code(), 100);

        // the only usable address is free again
        let mut storage =
            weft_ipam::Storage::open(weft_ipam::StoragePaths::in_dir(node.data_dir())).unwrap();
        let used = storage
            .read(|state| {
                Ok::<_, Error>(
                    state
                        .family(weft_config::Family::V4)
                        .map(|family| family.record.len()),
                )
            })
            .unwrap();
        assert_eq!(used, Some(0));
    }

    #[test]
    fn failed_retry_keeps_existing_lease() {
        let node = Node::new("10.244.0.0/16", "10.244.1.0/30");
        let out = node.run(&node.args(Command::Add, "a")).unwrap();
        let first: Value = serde_json::from_str(&out).unwrap();

        node.devices.fail("ensure_bridge");
        let err = node.run(&node.args(Command::Add, "a")).unwrap_err();
        assert_eq!(err.code(), 100);

        let mut storage =
            weft_ipam::Storage::open(weft_ipam::StoragePaths::in_dir(node.data_dir())).unwrap();
        let held = storage
            .read(|state| {
                Ok::<_, Error>(
                    state
                        .family(weft_config::Family::V4)
                        .and_then(|family| family.record.get_by_id("a")),
                )
            })
            .unwrap();
        assert_eq!(
            held.map(|addr| addr.to_string()),
            first["ips"][0]["address"].as_str().map(|address| address.to_owned())
        );

        // the /30 has a single usable address and it is still taken
        assert_eq!(node.run(&node.args(Command::Add, "b")).unwrap_err().code(), 11);
    }

    #[test]
    fn result_follows_requested_version() {
        let node = Node::new("10.244.0.0/16", "10.244.1.0/24");

        let out = node
            .run_with_version(&node.args(Command::Add, "abc"), "0.4.0")
            .unwrap();
        let result: Value = serde_json::from_str(&out).unwrap();

        assert_eq!(result["cniVersion"], "0.4.0");
        assert_eq!(result["ips"][0]["version"], "4");

        let out = node.run(&node.args(Command::Add, "abc")).unwrap();
        let result: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(result["cniVersion"], "1.0.0");
        assert!(result["ips"][0].get("version").is_none());
    }

    #[test]
    fn add_before_bootstrap() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = Node {
            dir,
            devices: Default::default(),
        };

        let err = node.run(&node.args(Command::Add, "abc")).unwrap_err();
        assert_eq!(err.code(), 11);
    }
}
