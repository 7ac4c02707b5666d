use std::{
    fs,
    net::IpAddr,
    os::unix,
    path::{Path, PathBuf},
    process::Command,
};

use ipnet::IpNet;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, info, instrument, warn};
use weft_config::Family;

use crate::{
    masquerade::{masquerade_rules, supports_random_fully, MASQUERADE_CHAIN},
    ContainerLink, DeviceError, Devices, FdbEntry, Link, LinkKind, LinkState, Neighbor,
    NetworkInfo, Route, VxlanInfo, VxlanSpec,
};

const NETNS_DIR: &str = "/var/run/netns";

/// Replies meaning the object to delete is already gone.
const NOT_FOUND: [&str; 4] = [
    "No such process",
    "No such file or directory",
    "Cannot find device",
    "does not exist",
];

/// [`Devices`] backed by the `ip`, `bridge` and `iptables` tools.
#[derive(Clone, Debug)]
pub struct IpRoute2 {
    netns_dir: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            netns_dir: PathBuf::from(NETNS_DIR),
        }
    }
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self::default()
    }

    fn link_netns(&self, netns: &Path, container_id: &str) -> Result<NetnsLink, DeviceError> {
        NetnsLink::new(&self.netns_dir, netns, container_id)
    }

    fn link_in(&self, netns: Option<&str>, name: &str) -> Result<Option<Link>, DeviceError> {
        let mut args = vec![];
        if let Some(netns) = netns {
            args.extend(["-n", netns]);
        }
        args.extend(["-j", "-d", "addr", "show", "dev", name]);

        let output = match run("ip", &args) {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err),
        };

        let links = parse_links(&output).map_err(|source| DeviceError::Parse {
            cmd: command_line("ip", &args),
            source,
        })?;
        Ok(links.into_iter().next())
    }

    fn create_vxlan(&self, spec: &VxlanSpec) -> Result<(), DeviceError> {
        let vni = spec.vni.to_string();
        let port = spec.port.to_string();
        let local = spec.local.to_string();
        let mac = spec.mac.to_string();

        let mut args = vec![
            "link",
            "add",
            spec.name.as_str(),
            "address",
            mac.as_str(),
            "type",
            "vxlan",
            "id",
            vni.as_str(),
            "local",
            local.as_str(),
            "dev",
            spec.parent.as_str(),
            "dstport",
            port.as_str(),
        ];
        if !spec.learning {
            args.push("nolearning");
        }
        run("ip", &args)?;
        Ok(())
    }
}

impl Devices for IpRoute2 {
    #[instrument(skip(self))]
    fn ensure_bridge(&self, name: &str, gateways: &[IpNet]) -> Result<Link, DeviceError> {
        let link = self.link_by_name(name)?;
        match LinkState::bridge(link.as_ref(), gateways) {
            LinkState::Configured => return link.ok_or_else(|| not_found(name)),
            LinkState::Conflicting => return Err(conflicting(name, link.as_ref())),
            LinkState::Absent => {
                info!("creating bridge");
                run("ip", &["link", "add", name, "type", "bridge"])?;
            }
            LinkState::Misconfigured => debug!("reconfiguring bridge"),
        }

        for gateway in gateways {
            run("ip", &["addr", "replace", &gateway.to_string(), "dev", name])?;
        }
        run("ip", &["link", "set", name, "up"])?;

        self.link_by_name(name)?.ok_or_else(|| not_found(name))
    }

    #[instrument(skip(self, networks), fields(netns = %netns.display()))]
    fn setup_veth(
        &self,
        netns: &Path,
        container_id: &str,
        bridge: &str,
        if_name: &str,
        networks: &[NetworkInfo],
    ) -> Result<ContainerLink, DeviceError> {
        let _netns_link = self.link_netns(netns, container_id)?;
        let ns = container_id;

        if self.link_in(Some(ns), if_name)?.is_some() {
            debug!("removing leftover container interface");
            run("ip", &["-n", ns, "link", "del", if_name])?;
        }

        let suffix = veth_suffix();
        let host_if = format!("veth{suffix}");
        let peer_if = format!("peer{suffix}");

        run(
            "ip",
            &["link", "add", &peer_if, "type", "veth", "peer", "name", &host_if],
        )?;
        run("ip", &["link", "set", &host_if, "master", bridge])?;
        run("ip", &["link", "set", &host_if, "up"])?;
        run("ip", &["link", "set", &peer_if, "netns", ns])?;

        run("ip", &["-n", ns, "link", "set", &peer_if, "name", if_name])?;
        run("ip", &["-n", ns, "link", "set", "lo", "up"])?;
        run("ip", &["-n", ns, "link", "set", if_name, "up"])?;

        for network in networks {
            let family = family_flag(Family::of(&network.addr));
            let gateway = network.gateway.to_string();

            run("ip", &["-n", ns, "addr", "replace", &network.addr.to_string(), "dev", if_name])?;
            run(
                "ip",
                &[
                    "-n", ns, family, "route", "replace", "default", "via", &gateway, "dev",
                    if_name,
                ],
            )?;
            run(
                "ip",
                &[
                    "-n",
                    ns,
                    family,
                    "route",
                    "replace",
                    &network.cluster_cidr.to_string(),
                    "via",
                    &gateway,
                    "dev",
                    if_name,
                ],
            )?;
        }

        let container = self
            .link_in(Some(ns), if_name)?
            .ok_or_else(|| not_found(if_name))?;
        let host = self.link_by_name(&host_if)?;

        info!(%host_if, "container interface ready");

        Ok(ContainerLink {
            host_if,
            host_mac: host.and_then(|link| link.mac),
            container_if: if_name.to_owned(),
            container_mac: container.mac,
            sandbox: netns.to_path_buf(),
        })
    }

    #[instrument(skip(self), fields(netns = %netns.display()))]
    fn del_veth(&self, netns: &Path, container_id: &str, if_name: &str) -> Result<(), DeviceError> {
        if !netns.exists() {
            debug!("network namespace already gone");
            return Ok(());
        }

        let _netns_link = self.link_netns(netns, container_id)?;
        run_ignore_missing("ip", &["-n", container_id, "link", "del", if_name])
    }

    fn container_addrs(
        &self,
        netns: &Path,
        container_id: &str,
        if_name: &str,
    ) -> Result<Vec<IpNet>, DeviceError> {
        let _netns_link = self.link_netns(netns, container_id)?;
        let link = self
            .link_in(Some(container_id), if_name)?
            .ok_or_else(|| not_found(if_name))?;
        Ok(link.addrs)
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    fn ensure_vxlan(&self, spec: &VxlanSpec) -> Result<Link, DeviceError> {
        let link = self.link_by_name(&spec.name)?;
        match LinkState::vxlan(link.as_ref(), spec) {
            LinkState::Configured => return link.ok_or_else(|| not_found(&spec.name)),
            LinkState::Conflicting => return Err(conflicting(&spec.name, link.as_ref())),
            LinkState::Absent => {
                info!(vni = spec.vni, local = %spec.local, "creating vxlan device");
                self.create_vxlan(spec)?;
            }
            LinkState::Misconfigured => match &link {
                Some(existing) if LinkState::vxlan_needs_recreate(existing, spec) => {
                    warn!("vxlan parameters changed, recreating device");
                    run("ip", &["link", "del", &spec.name])?;
                    self.create_vxlan(spec)?;
                }
                _ => debug!("reconfiguring vxlan device"),
            },
        }

        run("ip", &["addr", "replace", &spec.addr.to_string(), "dev", &spec.name])?;
        run("ip", &["link", "set", &spec.name, "up"])?;

        self.link_by_name(&spec.name)?
            .ok_or_else(|| not_found(&spec.name))
    }

    fn link_by_name(&self, name: &str) -> Result<Option<Link>, DeviceError> {
        self.link_in(None, name)
    }

    fn default_link(&self, family: Family) -> Result<Link, DeviceError> {
        let args = ["-j", family_flag(family), "route", "show", "default"];
        let output = run("ip", &args)?;
        let routes: Vec<IpRouteEntry> = parse(&output, &args)?;

        let dev = routes
            .into_iter()
            .find_map(|route| route.dev)
            .ok_or(DeviceError::NoDefaultRoute(family))?;

        self.link_by_name(&dev)?.ok_or_else(|| not_found(&dev))
    }

    fn host_addr(&self, family: Family) -> Result<IpNet, DeviceError> {
        let link = self.default_link(family)?;
        link.addr_of(family).ok_or(DeviceError::NoAddress {
            link: link.name,
            family,
        })
    }

    fn route_add(&self, route: &Route) -> Result<(), DeviceError> {
        run("ip", &strs(&route_args("replace", route)))?;
        Ok(())
    }

    fn route_del(&self, route: &Route) -> Result<(), DeviceError> {
        run_ignore_missing("ip", &strs(&route_args("del", route)))
    }

    fn neigh_add(&self, neigh: &Neighbor) -> Result<(), DeviceError> {
        let addr = neigh.addr.to_string();
        let mac = neigh.mac.to_string();
        run(
            "ip",
            &[
                "neigh", "replace", &addr, "lladdr", &mac, "dev", &neigh.dev, "nud", "permanent",
            ],
        )?;
        Ok(())
    }

    fn neigh_del(&self, neigh: &Neighbor) -> Result<(), DeviceError> {
        let addr = neigh.addr.to_string();
        run_ignore_missing("ip", &["neigh", "del", &addr, "dev", &neigh.dev])
    }

    fn fdb_add(&self, entry: &FdbEntry) -> Result<(), DeviceError> {
        run("bridge", &strs(&fdb_args("replace", entry)))?;
        Ok(())
    }

    fn fdb_del(&self, entry: &FdbEntry) -> Result<(), DeviceError> {
        run_ignore_missing("bridge", &strs(&fdb_args("del", entry)))
    }

    #[instrument(skip(self))]
    fn ensure_masquerade(&self, family: Family, cluster: IpNet, pod: IpNet) -> Result<(), DeviceError> {
        let tool = match family {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        };

        let random_fully = run(tool, &["--version"])
            .map(|version| supports_random_fully(&version))
            .unwrap_or(false);

        if let Err(err) = run(tool, &["-t", "nat", "-N", MASQUERADE_CHAIN]) {
            if !err.to_string().contains("already exists") {
                return Err(err);
            }
        }

        let jump = ["-t", "nat", "-C", "POSTROUTING", "-j", MASQUERADE_CHAIN];
        if run(tool, &jump).is_err() {
            run(
                tool,
                &["-t", "nat", "-I", "POSTROUTING", "1", "-j", MASQUERADE_CHAIN],
            )?;
        }

        for rule in masquerade_rules(family, cluster, pod, random_fully) {
            let mut check = vec!["-t", "nat", "-C", MASQUERADE_CHAIN];
            check.extend(strs(&rule));
            if run(tool, &check).is_ok() {
                continue;
            }
            check[2] = "-A";
            run(tool, &check)?;
        }

        info!("masquerade rules in place");
        Ok(())
    }
}

/// Exposes a CNI network namespace path as a named `ip netns` entry for the
/// lifetime of the value.
struct NetnsLink {
    path: PathBuf,
}

impl NetnsLink {
    fn new(netns_dir: &Path, netns: &Path, container_id: &str) -> Result<Self, DeviceError> {
        let netns_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DeviceError::Netns { path, source }
        };

        fs::create_dir_all(netns_dir).map_err(netns_err(netns_dir))?;

        let path = netns_dir.join(container_id);
        if let Ok(meta) = fs::symlink_metadata(&path) {
            if meta.file_type().is_symlink() {
                fs::remove_file(&path).map_err(netns_err(&path))?;
            }
        }
        unix::fs::symlink(netns, &path).map_err(netns_err(&path))?;

        Ok(Self { path })
    }
}

impl Drop for NetnsLink {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove netns link");
        }
    }
}

#[derive(Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct IpVxlanData {
    id: u32,
    #[serde(default)]
    local: Option<IpAddr>,
    #[serde(default)]
    local6: Option<IpAddr>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    learning: bool,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    local: Option<IpAddr>,
    #[serde(default)]
    prefixlen: Option<u8>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct IpRouteEntry {
    #[serde(default)]
    dev: Option<String>,
}

fn parse_links(output: &str) -> Result<Vec<Link>, serde_json::Error> {
    let links: Vec<IpLink> = serde_json::from_str(output)?;
    links.into_iter().map(Link::try_from).collect()
}

impl TryFrom<IpLink> for Link {
    type Error = serde_json::Error;

    fn try_from(link: IpLink) -> Result<Self, Self::Error> {
        let (kind, data) = link
            .linkinfo
            .map(|info| (info.info_kind, info.info_data))
            .unwrap_or_default();

        let kind = match kind.as_deref() {
            Some("bridge") => LinkKind::Bridge,
            Some("veth") => LinkKind::Veth,
            Some("vxlan") => {
                let data: IpVxlanData =
                    serde_json::from_value(data.unwrap_or(serde_json::Value::Null))?;
                LinkKind::Vxlan(VxlanInfo {
                    vni: data.id,
                    local: data.local.or(data.local6),
                    port: data.port.unwrap_or_default(),
                    learning: data.learning,
                })
            }
            _ => LinkKind::Other(kind),
        };

        let addrs = link
            .addr_info
            .into_iter()
            .filter(|info| info.scope.as_deref().unwrap_or("global") == "global")
            .filter_map(|info| IpNet::new(info.local?, info.prefixlen?).ok())
            .collect();

        Ok(Link {
            name: link.ifname,
            index: link.ifindex,
            kind,
            mac: link.address.and_then(|mac| mac.parse().ok()),
            addrs,
            up: link.flags.iter().any(|flag| flag == "UP"),
        })
    }
}

fn route_args(verb: &str, route: &Route) -> Vec<String> {
    let mut args = vec![
        family_flag(Family::of(&route.dst)).to_owned(),
        "route".into(),
        verb.into(),
        route.dst.to_string(),
        "via".into(),
        route.via.to_string(),
        "dev".into(),
        route.dev.clone(),
    ];
    if route.onlink {
        args.push("onlink".into());
    }
    args
}

fn fdb_args(verb: &str, entry: &FdbEntry) -> Vec<String> {
    let mut args = vec![
        "fdb".into(),
        verb.into(),
        entry.mac.to_string(),
        "dev".into(),
        entry.dev.clone(),
        "dst".into(),
        entry.dst.to_string(),
        "self".into(),
    ];
    if verb != "del" {
        args.push("permanent".into());
    }
    args
}

fn family_flag(family: Family) -> &'static str {
    match family {
        Family::V4 => "-4",
        Family::V6 => "-6",
    }
}

fn veth_suffix() -> String {
    let mut rng = rand::thread_rng();
    let charset: &[u8] = b"0123456789abcdef";

    (0..8)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

fn strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

fn command_line(cmd: &str, args: &[&str]) -> String {
    format!("{cmd} {}", args.join(" "))
}

fn run(cmd: &str, args: &[&str]) -> Result<String, DeviceError> {
    let line = command_line(cmd, args);
    debug!("running command: {line}");

    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|source| DeviceError::Spawn {
            cmd: line.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(DeviceError::Command {
            cmd: line,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn run_ignore_missing(cmd: &str, args: &[&str]) -> Result<(), DeviceError> {
    match run(cmd, args) {
        Err(err) if is_not_found(&err) => {
            debug!("already absent: {err}");
            Ok(())
        }
        other => other.map(drop),
    }
}

fn parse<T: DeserializeOwned>(output: &str, args: &[&str]) -> Result<T, DeviceError> {
    serde_json::from_str(output).map_err(|source| DeviceError::Parse {
        cmd: command_line("ip", args),
        source,
    })
}

fn is_not_found(err: &DeviceError) -> bool {
    match err {
        DeviceError::Command { stderr, .. } => NOT_FOUND.iter().any(|reply| stderr.contains(reply)),
        _ => false,
    }
}

fn not_found(name: &str) -> DeviceError {
    DeviceError::LinkNotFound(name.to_owned())
}

fn conflicting(name: &str, link: Option<&Link>) -> DeviceError {
    DeviceError::Conflicting {
        name: name.to_owned(),
        kind: link.map(|link| link.kind.to_string()).unwrap_or_default(),
    }
}
