use std::{path::PathBuf, sync::Arc};

use agent::{
    context::Context,
    event::pod_cidrs,
    reconciler::Reconciler,
    strategy::{self, Local, Mode},
};
use anyhow::Context as _;
use clap::Parser;
use ipnet::IpNet;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use weft_config::{parse_cidrs, ConfigError, NetConf, NetworkConfigs};
use weft_devices::{Devices, IpRoute2};
use weft_ipam::{Storage, StoragePaths, DEFAULT_DATA_DIR};

const CNI_CONF_FILE: &str = "10-weft.conflist";

#[derive(Debug, Parser)]
#[clap(version, about)]
struct Opt {
    /// How pods on other nodes are reached.
    #[clap(long, value_enum, default_value_t = Mode::Vxlan)]
    mode: Mode,

    /// Comma separated cluster CIDRs; read from kube-proxy when omitted.
    #[clap(long)]
    cluster_cidr: Option<String>,

    /// Masquerade traffic leaving the cluster network.
    #[clap(long)]
    ip_masq: bool,

    /// Comma separated subnets cross-subnet mode routes directly.
    #[clap(long)]
    local_subnet: Option<String>,

    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    #[clap(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[clap(long, default_value = "/etc/cni/net.d")]
    cni_conf_dir: PathBuf,

    #[clap(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    weft_trace::setup_tracing_to_stdout(&opt.log_level);
    info!(?opt, "starting weftd");

    let context = Context::new().await?;

    let node = context
        .get_node(&opt.node_name)
        .await
        .with_context(|| format!("failed to fetch node {}", opt.node_name))?;
    let pod_cidrs = pod_cidrs(&node);
    if pod_cidrs.is_empty() {
        return Err(ConfigError::NoPodCidr.into());
    }

    let cluster_cidrs = match opt.cluster_cidr.as_deref() {
        Some(cidrs) => parse_cidrs(cidrs)?,
        None => context.get_cluster_cidr().await?,
    };
    let configs = NetworkConfigs::from_cidrs(&cluster_cidrs, &pod_cidrs)?;
    info!(?configs, "network configuration");

    Storage::bootstrap(StoragePaths::in_dir(&opt.data_dir), &configs)?;
    write_cni_config(&opt, &cluster_cidrs)?;

    let devices: Arc<dyn Devices> = Arc::new(IpRoute2::new());
    if opt.ip_masq {
        for (family, config) in configs.iter() {
            devices.ensure_masquerade(family, config.cluster_cidr, config.pod_cidr)?;
        }
    }

    let local_subnets = match opt.local_subnet.as_deref() {
        Some(subnets) => parse_cidrs(subnets)?,
        None => vec![],
    };
    let (strategy, annotations) = strategy::register(
        opt.mode,
        &Local {
            node_name: &opt.node_name,
            devices,
            configs: &configs,
            local_subnets: &local_subnets,
        },
    )?;
    context
        .patch_annotations(&opt.node_name, &annotations)
        .await?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    Reconciler::new(context.node_watch(), strategy)
        .run(token)
        .await;

    info!("weftd stopped");
    Ok(())
}

fn write_cni_config(opt: &Opt, cluster_cidrs: &[IpNet]) -> anyhow::Result<()> {
    let network = cluster_cidrs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let data_dir = (opt.data_dir != PathBuf::from(DEFAULT_DATA_DIR)).then_some(opt.data_dir.as_path());

    let path = opt.cni_conf_dir.join(CNI_CONF_FILE);
    NetConf::new(&network, data_dir)
        .write_conflist(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "wrote cni configuration");
    Ok(())
}

async fn shutdown_on_signal(token: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!(%err, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
    token.cancel();
}
