use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, StatefulSet},
    core::v1::{ConfigMap, Pod, PodSpec, Secret, ServiceAccount},
};
use kube::{api::ListParams, Api, Client};
use log::debug;
use serde::de::DeserializeOwned;

use crate::workload::{pod_specs, WorkloadKind};

/// True for a 404 from the API server.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True when the object is either missing or hidden from us (404 or 403).
pub fn is_absent(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404 || resp.code == 403)
}

struct CacheData<K> {
    by_name: HashMap<String, Option<K>>,
}
impl<K> Default for CacheData<K> {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }
}

/// An `Api` with a by-name cache of `get` results, absent objects included.
pub struct CachedApi<K> {
    pub api: Api<K>,
    cache: RwLock<CacheData<K>>,
}

impl<K> CachedApi<K> {
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            cache: Default::default(),
        }
    }

    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .clear();
    }
}

impl<K: Clone + DeserializeOwned + Debug> CachedApi<K> {
    /// Gets `name`, answering from the cache when possible.
    ///
    /// Objects that do not exist, or that we are not allowed to read, are
    /// `Ok(None)` and are cached as such. Other errors are not cached.
    pub async fn get_opt_cached(&self, name: &str) -> kube::Result<Option<K>> {
        if let Some(val) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
        {
            debug!("cache hit for {}", name);
            return Ok(val);
        }
        let val = match self.api.get(name).await {
            Ok(val) => Some(val),
            Err(err) if is_absent(&err) => {
                debug!("{} is absent: {}", name, err);
                None
            }
            Err(err) => return Err(err),
        };
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .insert(name.to_owned(), val.clone());
        Ok(val)
    }
}

pub struct Cluster {
    pub client: Client,
    pub namespaces: Mutex<BTreeMap<String, Arc<Apis>>>,
}

impl Cluster {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Cluster {
            client,
            namespaces: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn get_namespace(&self, ns: &str) -> Arc<Apis> {
        let mut nss = self
            .namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(apis) = nss.get(ns).cloned() {
            apis
        } else {
            let apis = Arc::new(Apis::namespaced(&self.client, ns));
            nss.insert(ns.to_string(), apis.clone());
            apis
        }
    }
}

pub struct Apis {
    pub namespace: String,
    pub pod: Api<Pod>,
    pub deployment: Api<Deployment>,
    pub daemon_set: Api<DaemonSet>,
    pub stateful_set: Api<StatefulSet>,
    pub service_account: CachedApi<ServiceAccount>,
    pub config_map: Api<ConfigMap>,
    pub secret: Api<Secret>,
}

impl Apis {
    pub fn namespaced(client: &Client, namespace: &str) -> Self {
        Apis {
            namespace: namespace.to_string(),
            pod: Api::namespaced(client.clone(), namespace),
            deployment: Api::namespaced(client.clone(), namespace),
            daemon_set: Api::namespaced(client.clone(), namespace),
            stateful_set: Api::namespaced(client.clone(), namespace),
            service_account: CachedApi::new(Api::namespaced(client.clone(), namespace)),
            config_map: Api::namespaced(client.clone(), namespace),
            secret: Api::namespaced(client.clone(), namespace),
        }
    }

    /// Lists every object of `kind` in the namespace and returns the pod specs
    /// that are present.
    pub async fn list_pod_specs(&self, kind: WorkloadKind) -> kube::Result<Vec<PodSpec>> {
        let params = ListParams::default();
        let specs = match kind {
            WorkloadKind::Pod => pod_specs(self.pod.list(&params).await?.items),
            WorkloadKind::Deployment => pod_specs(self.deployment.list(&params).await?.items),
            WorkloadKind::DaemonSet => pod_specs(self.daemon_set.list(&params).await?.items),
            WorkloadKind::StatefulSet => pod_specs(self.stateful_set.list(&params).await?.items),
        };
        debug!(
            "listed {} {} pod specs in {}",
            specs.len(),
            kind,
            self.namespace
        );
        Ok(specs)
    }
}
