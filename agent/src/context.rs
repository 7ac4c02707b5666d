use futures::Stream;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{
    api::{Patch, PatchParams},
    runtime::{watcher, WatchStreamExt},
    Api,
};
use serde_json::json;
use tracing::{debug, info};
use weft_config::parse_cidrs;

use crate::{
    annotation::{Annotations, ANNOTATION_KEY},
    Error, Result,
};

/// Kubernetes API access of the daemon.
pub struct Context {
    client: kube::Client,
}

impl Context {
    pub async fn new() -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self { client })
    }

    pub async fn get_node(&self, name: &str) -> Result<Node> {
        Ok(Api::<Node>::all(self.client.clone()).get(name).await?)
    }

    /// Cluster CIDR(s) kube-proxy was configured with.
    pub async fn get_cluster_cidr(&self) -> Result<Vec<IpNet>> {
        let cidr = Api::<ConfigMap>::namespaced(self.client.clone(), "kube-system")
            .get("kube-proxy")
            .await?
            .data
            .and_then(|data| data.get("config.conf").cloned())
            .and_then(|conf| serde_yaml::from_str::<serde_yaml::Value>(&conf).ok())
            .and_then(|yaml| yaml["clusterCIDR"].as_str().map(ToOwned::to_owned))
            .ok_or(Error::ClusterCidrNotFound)?;
        debug!(%cidr, "cluster cidr from kube-proxy");

        Ok(parse_cidrs(&cidr)?)
    }

    /// Publishes this node's overlay identity for its peers.
    pub async fn patch_annotations(&self, node_name: &str, annotations: &Annotations) -> Result<()> {
        let value = serde_json::to_string(annotations)?;
        let patch = json!({
            "metadata": {
                "annotations": {
                    ANNOTATION_KEY: value,
                }
            }
        });

        Api::<Node>::all(self.client.clone())
            .patch(node_name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        info!(node = node_name, %value, "published overlay annotation");
        Ok(())
    }

    /// Watch over all nodes, re-listing with backoff after failures.
    pub fn node_watch(
        &self,
    ) -> impl Stream<Item = Result<watcher::Event<Node>, watcher::Error>> + Send + 'static {
        watcher(Api::<Node>::all(self.client.clone()), watcher::Config::default()).backoff(watcher::default_backoff())
    }
}
