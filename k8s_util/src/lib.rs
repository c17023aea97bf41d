//! Cluster plumbing shared by the cleanup operator: client setup, namespaced
//! API handles and the pure walk over pod specs that finds which Secrets and
//! ConfigMaps a workload depends on.

use anyhow::Context as _;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};

pub mod apis;
pub mod references;
pub mod workload;

/// Builds a client from the in-cluster environment or the local kubeconfig.
///
/// When `k8s_context` is given the kubeconfig is always used, pinned to that
/// context.
pub async fn create_client(k8s_context: Option<&str>) -> anyhow::Result<Client> {
    let config = match k8s_context {
        Some(context) => {
            let kubeconfig = Kubeconfig::read().context("when reading kubeconfig")?;
            let options = KubeConfigOptions {
                context: Some(context.to_owned()),
                ..Default::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .with_context(|| format!("when loading kubeconfig context `{}`", context))?
        }
        None => Config::infer()
            .await
            .context("when inferring cluster config")?,
    };

    log::debug!(
        "using cluster {} (default namespace {})",
        config.cluster_url,
        config.default_namespace
    );

    Client::try_from(config).context("attempting to get client")
}
