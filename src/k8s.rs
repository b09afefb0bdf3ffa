//! Local cluster state built from Kubernetes watches.
//!
//! This module keeps reflector stores of `Service`, `Endpoints` and `Pod` resources and
//! calls registered handlers whenever one of them changes.
//!
//! # How It Works
//!
//! 1. Watches `Service`, `Endpoints` and `Pod` resources with one watcher per kind
//! 2. Applies each event to that kind's reflector store
//! 3. Calls `on_add`, `on_update` or `on_delete` on the registered handlers, after the
//!    store reflects the change
//! 4. Calls `on_resync` when a (re)list completes and the store contents are replaced
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kube_destination::{Cluster, EndpointsWatcher, SyncConfig, sync};
//!
//! let mut cluster = Cluster::new();
//! let watcher = Arc::new(EndpointsWatcher::new(cluster.store()));
//! cluster.register(&watcher);
//!
//! let store = cluster.store();
//! sync(cluster, SyncConfig::new().ignore_namespace("kube-system"));
//! store.wait_until_ready().await?;
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use futures::{StreamExt, stream};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{EndpointAddress, Endpoints, Pod, Service};
use kube::runtime::WatchStreamExt;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client, Resource};
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::resolve::{PodRef, pod_ip, pod_ref};

/// Callbacks for changes to one kind of cluster object.
///
/// Callbacks run on the sync task after the store has been updated, so lookups made
/// from a callback already observe the change.
pub trait EventHandler<K>: Send + Sync {
    /// An object not previously in the store was added.
    fn on_add(&self, obj: &K);

    /// An object already in the store was replaced.
    fn on_update(&self, old: &K, new: &K);

    /// An object was removed from the store.
    fn on_delete(&self, obj: &K);

    /// The store's contents were replaced by a complete listing.
    fn on_resync(&self) {}
}

/// A reflector store of one kind plus the handlers interested in it.
struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Writer<K>,
    store: Store<K>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn new() -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();

        Self {
            writer,
            store,
            handlers: Vec::new(),
        }
    }

    fn apply(&mut self, event: &Event<K>) {
        match event {
            Event::Apply(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(event);

                for handler in &self.handlers {
                    match &old {
                        Some(old) => handler.on_update(old, obj),
                        None => handler.on_add(obj),
                    }
                }
            }

            Event::Delete(obj) => {
                self.writer.apply_watcher_event(event);

                for handler in &self.handlers {
                    handler.on_delete(obj);
                }
            }

            // Buffered by the writer until the listing completes.
            Event::Init | Event::InitApply(_) => self.writer.apply_watcher_event(event),

            Event::InitDone => {
                self.writer.apply_watcher_event(event);

                for handler in &self.handlers {
                    handler.on_resync();
                }
            }
        }
    }
}

/// The writable side of the local cluster state.
///
/// Events applied here update the stores handed out by [`Cluster::store`] and are then
/// dispatched to every registered handler.
pub struct Cluster {
    services: Informer<Service>,
    endpoints: Informer<Endpoints>,
    pods: Informer<Pod>,
    pod_ips: Arc<PodIndex>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    /// Creates empty stores.
    #[must_use]
    pub fn new() -> Self {
        let mut pods = Informer::new();
        let pod_ips = Arc::new(PodIndex::new(pods.store.clone()));

        // First handler, so the index is current before anyone else hears of a change.
        let index: Arc<dyn EventHandler<Pod>> = pod_ips.clone();
        pods.handlers.push(index);

        Self {
            services: Informer::new(),
            endpoints: Informer::new(),
            pods,
            pod_ips,
        }
    }

    /// Returns a read handle on the stores.
    #[must_use]
    pub fn store(&self) -> ClusterStore {
        ClusterStore {
            services: self.services.store.clone(),
            endpoints: self.endpoints.store.clone(),
            pods: self.pods.store.clone(),
            pod_ips: self.pod_ips.clone(),
        }
    }

    /// Registers a handler for service, endpoints and pod changes.
    pub fn register<H>(&mut self, handler: &Arc<H>)
    where
        H: EventHandler<Service> + EventHandler<Endpoints> + EventHandler<Pod> + 'static,
    {
        let services: Arc<dyn EventHandler<Service>> = handler.clone();
        let endpoints: Arc<dyn EventHandler<Endpoints>> = handler.clone();
        let pods: Arc<dyn EventHandler<Pod>> = handler.clone();

        self.services.handlers.push(services);
        self.endpoints.handlers.push(endpoints);
        self.pods.handlers.push(pods);
    }

    /// Applies a `Service` watch event.
    pub fn apply_service(&mut self, event: &Event<Service>) {
        self.services.apply(event);
    }

    /// Applies an `Endpoints` watch event.
    pub fn apply_endpoints(&mut self, event: &Event<Endpoints>) {
        self.endpoints.apply(event);
    }

    /// Applies a `Pod` watch event.
    pub fn apply_pod(&mut self, event: &Event<Pod>) {
        self.pods.apply(event);
    }
}

/// Read access to the local cluster state. Cheap to clone.
#[derive(Clone)]
pub struct ClusterStore {
    services: Store<Service>,
    endpoints: Store<Endpoints>,
    pods: Store<Pod>,
    pod_ips: Arc<PodIndex>,
}

impl ClusterStore {
    /// Looks up a service.
    #[must_use]
    pub fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }

    /// Looks up the endpoints of a service.
    #[must_use]
    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        self.endpoints.get(&ObjectRef::new(name).within(namespace))
    }

    /// Looks up a pod.
    #[must_use]
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.get(&ObjectRef::new(name).within(namespace))
    }

    /// Finds the pod currently holding `ip` as its `status.podIP`.
    ///
    /// Pods that have terminated are ignored. If several running pods share the IP, as
    /// host-network pods do, the one seen first wins.
    #[must_use]
    pub fn pod_by_ip(&self, ip: IpAddr) -> Option<Arc<Pod>> {
        let pod = self.pod_ips.get(ip, None)?;
        self.pod(&pod.namespace, &pod.name)
    }

    /// Returns the locally-known pod backing an address entry of an `Endpoints` object
    /// in `namespace`.
    ///
    /// Entries without a pod reference are matched by IP, preferring pods in `namespace`.
    pub(crate) fn backing_pod(&self, namespace: &str, entry: &EndpointAddress) -> Option<PodRef> {
        match pod_ref(entry, namespace) {
            Some(pod) => self.pod(&pod.namespace, &pod.name).map(|_| pod),
            None => {
                let ip = entry.ip.parse().ok()?;
                self.pod_ips.get(ip, Some(namespace))
            }
        }
    }

    /// Waits until every kind has completed its initial listing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] if the [`Cluster`] was dropped first.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let (services, endpoints, pods) = futures::join!(
            self.services.wait_until_ready(),
            self.endpoints.wait_until_ready(),
            self.pods.wait_until_ready(),
        );

        services
            .and(endpoints)
            .and(pods)
            .map_err(|_| Error::StoreClosed)
    }
}

/// Running pods by IP, each list in the order the pods were first seen.
struct PodIndex {
    store: Store<Pod>,
    by_ip: RwLock<HashMap<IpAddr, Vec<PodRef>>>,
}

impl PodIndex {
    fn new(store: Store<Pod>) -> Self {
        Self {
            store,
            by_ip: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, ip: IpAddr, namespace: Option<&str>) -> Option<PodRef> {
        let by_ip = self.by_ip.read();
        let pods = by_ip.get(&ip)?;

        namespace
            .and_then(|namespace| pods.iter().find(|pod| pod.namespace == namespace))
            .or_else(|| pods.first())
            .cloned()
    }

    fn insert(by_ip: &mut HashMap<IpAddr, Vec<PodRef>>, pod: &Pod) {
        let Some(ip) = live_pod_ip(pod) else {
            return;
        };

        let pod = PodRef::of(pod);
        let pods = by_ip.entry(ip).or_default();
        if !pods.contains(&pod) {
            pods.push(pod);
        }
    }

    fn remove(by_ip: &mut HashMap<IpAddr, Vec<PodRef>>, pod: &Pod) {
        let Some(ip) = live_pod_ip(pod) else {
            return;
        };

        let pod = PodRef::of(pod);
        if let Some(pods) = by_ip.get_mut(&ip) {
            pods.retain(|other| *other != pod);
            if pods.is_empty() {
                by_ip.remove(&ip);
            }
        }
    }
}

impl EventHandler<Pod> for PodIndex {
    fn on_add(&self, pod: &Pod) {
        Self::insert(&mut self.by_ip.write(), pod);
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        let mut by_ip = self.by_ip.write();

        // Unchanged pods keep their place.
        if live_pod_ip(old) != live_pod_ip(new) {
            Self::remove(&mut by_ip, old);
        }

        Self::insert(&mut by_ip, new);
    }

    fn on_delete(&self, pod: &Pod) {
        Self::remove(&mut self.by_ip.write(), pod);
    }

    fn on_resync(&self) {
        let mut rebuilt: HashMap<IpAddr, Vec<PodRef>> = HashMap::new();
        for pod in self.store.state() {
            Self::insert(&mut rebuilt, &pod);
        }

        let mut by_ip = self.by_ip.write();

        // Pods that survived the relist keep their place; new ones follow by name.
        for (ip, pods) in &mut rebuilt {
            pods.sort();
            if let Some(known) = by_ip.get(ip) {
                pods.sort_by_key(|pod| {
                    known
                        .iter()
                        .position(|other| other == pod)
                        .unwrap_or(usize::MAX)
                });
            }
        }

        *by_ip = rebuilt;
    }
}

/// The pod's IP, unless the pod has terminated and may have handed the IP on.
fn live_pod_ip(pod: &Pod) -> Option<IpAddr> {
    let phase = pod.status.as_ref()?.phase.as_deref();
    if matches!(phase, Some("Succeeded" | "Failed")) {
        return None;
    }

    pod_ip(pod)
}

/// Configuration for watching the cluster.
#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    /// Restricts all watches to one namespace. If `None`, watches the whole cluster.
    pub namespace: Option<String>,

    /// Namespaces whose pods are not watched.
    pub ignored_namespaces: Vec<String>,
}

impl SyncConfig {
    /// Creates a configuration that watches the whole cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the watches to a single namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Excludes a namespace from the pod watch.
    #[must_use]
    pub fn ignore_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.ignored_namespaces.push(namespace.into());
        self
    }

    fn api<K>(&self, client: &Client) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        }
    }

    fn pod_watcher_config(&self) -> WatcherConfig {
        if self.ignored_namespaces.is_empty() {
            return WatcherConfig::default();
        }

        let selector = self
            .ignored_namespaces
            .iter()
            .map(|ns| format!("metadata.namespace!={ns}"))
            .collect::<Vec<_>>()
            .join(",");

        WatcherConfig::default().fields(&selector)
    }
}

/// Starts watching the cluster with the default client configuration.
///
/// This function spawns a background task that watches services, endpoints and pods
/// and applies every event to `cluster`, which dispatches it to the registered
/// handlers. Use [`ClusterStore::wait_until_ready`] to wait for the initial listing.
///
/// # Requirements
///
/// - The application must have RBAC permissions to list and watch `Service`,
///   `Endpoints` and `Pod` resources
/// - Kubernetes client configuration (in-cluster or kubeconfig)
pub fn sync(cluster: Cluster, config: SyncConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        match Client::try_default().await {
            Ok(client) => sync_loop(cluster, client, config).await,
            Err(e) => tracing::error!("Kubernetes cluster sync failed: {}", Error::from(e)),
        }
    })
}

/// Like [`sync`], with an explicitly constructed client.
pub fn sync_with_client(cluster: Cluster, client: Client, config: SyncConfig) -> JoinHandle<()> {
    tokio::spawn(sync_loop(cluster, client, config))
}

/// A watch event of any of the synced kinds.
enum Change {
    Service(std::result::Result<Event<Service>, watcher::Error>),
    Endpoints(std::result::Result<Event<Endpoints>, watcher::Error>),
    Pod(std::result::Result<Event<Pod>, watcher::Error>),
}

/// Background task that applies watch events of all kinds, in arrival order.
async fn sync_loop(mut cluster: Cluster, client: Client, config: SyncConfig) {
    let services = watcher::watcher(config.api::<Service>(&client), WatcherConfig::default())
        .default_backoff();
    let endpoints = watcher::watcher(config.api::<Endpoints>(&client), WatcherConfig::default())
        .default_backoff();
    let pods = watcher::watcher(config.api::<Pod>(&client), config.pod_watcher_config())
        .default_backoff();

    let changes = stream::select(
        services.map(Change::Service),
        stream::select(endpoints.map(Change::Endpoints), pods.map(Change::Pod)),
    );
    tokio::pin!(changes);

    tracing::info!(
        "Starting Kubernetes sync in {}",
        config.namespace.as_deref().unwrap_or("all namespaces")
    );

    while let Some(change) = changes.next().await {
        match change {
            Change::Service(Ok(event)) => cluster.apply_service(&event),
            Change::Endpoints(Ok(event)) => cluster.apply_endpoints(&event),
            Change::Pod(Ok(event)) => cluster.apply_pod(&event),
            Change::Service(Err(e)) | Change::Endpoints(Err(e)) | Change::Pod(Err(e)) => {
                tracing::warn!("Kubernetes watch failed, retrying: {e}");
            }
        }
    }

    tracing::warn!("Kubernetes watches ended, stopping sync");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::{ObjectReference, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("ns".to_string()),
            ..Default::default()
        }
    }

    fn make_service(name: &str) -> Service {
        Service {
            metadata: meta(name),
            ..Default::default()
        }
    }

    fn make_pod(name: &str, ip: &str) -> Pod {
        Pod {
            metadata: meta(name),
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // A pod on 10.0.0.7
    fn make_shared_ip_pod(namespace: &str, name: &str, phase: &str) -> Pod {
        let mut pod = make_pod(name, "10.0.0.7");
        pod.metadata.namespace = Some(namespace.to_string());
        pod.status.as_mut().unwrap().phase = Some(phase.to_string());
        pod
    }

    // Records callbacks as strings
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn record(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl<K: Resource> EventHandler<K> for Recorder {
        fn on_add(&self, obj: &K) {
            self.record(format!("add {}", obj.meta().name.as_deref().unwrap_or_default()));
        }

        fn on_update(&self, _old: &K, new: &K) {
            self.record(format!("update {}", new.meta().name.as_deref().unwrap_or_default()));
        }

        fn on_delete(&self, obj: &K) {
            self.record(format!("delete {}", obj.meta().name.as_deref().unwrap_or_default()));
        }

        fn on_resync(&self) {
            self.record("resync".to_string());
        }
    }

    // SyncConfig tests

    #[test]
    fn config_defaults_to_all_namespaces() {
        let config = SyncConfig::new();

        assert!(config.namespace.is_none());
        assert!(config.ignored_namespaces.is_empty());
    }

    #[test]
    fn config_with_namespace() {
        let config = SyncConfig::new().namespace("my-namespace");
        assert_eq!(config.namespace, Some("my-namespace".to_string()));
    }

    #[test]
    fn config_ignored_namespaces_become_field_selector() {
        let config = SyncConfig::new()
            .ignore_namespace("kube-system")
            .ignore_namespace("linkerd");

        assert_eq!(
            config.pod_watcher_config().field_selector.as_deref(),
            Some("metadata.namespace!=kube-system,metadata.namespace!=linkerd")
        );
        assert!(SyncConfig::new().pod_watcher_config().field_selector.is_none());
    }

    // Cluster tests

    #[test]
    fn apply_distinguishes_add_update_delete() {
        let mut cluster = Cluster::new();
        let recorder = Arc::new(Recorder::default());
        cluster.register(&recorder);

        cluster.apply_service(&Event::Apply(make_service("name1")));
        cluster.apply_service(&Event::Apply(make_service("name1")));
        cluster.apply_service(&Event::Delete(make_service("name1")));

        assert_eq!(
            recorder.take(),
            ["add name1", "update name1", "delete name1"]
        );
    }

    #[test]
    fn store_reflects_change_before_callback() {
        struct Check(ClusterStore, Mutex<bool>);

        impl EventHandler<Service> for Check {
            fn on_add(&self, obj: &Service) {
                let name = obj.metadata.name.as_deref().unwrap();
                *self.1.lock().unwrap() = self.0.service("ns", name).is_some();
            }
            fn on_update(&self, _old: &Service, _new: &Service) {}
            fn on_delete(&self, _obj: &Service) {}
        }

        impl EventHandler<Endpoints> for Check {
            fn on_add(&self, _obj: &Endpoints) {}
            fn on_update(&self, _old: &Endpoints, _new: &Endpoints) {}
            fn on_delete(&self, _obj: &Endpoints) {}
        }

        impl EventHandler<Pod> for Check {
            fn on_add(&self, _obj: &Pod) {}
            fn on_update(&self, _old: &Pod, _new: &Pod) {}
            fn on_delete(&self, _obj: &Pod) {}
        }

        let mut cluster = Cluster::new();
        let check = Arc::new(Check(cluster.store(), Mutex::new(false)));
        cluster.register(&check);

        cluster.apply_service(&Event::Apply(make_service("name1")));
        assert!(*check.1.lock().unwrap());
    }

    #[test]
    fn relist_is_buffered_until_done() {
        let mut cluster = Cluster::new();
        let recorder = Arc::new(Recorder::default());
        cluster.register(&recorder);
        let store = cluster.store();

        cluster.apply_service(&Event::Init);
        cluster.apply_service(&Event::InitApply(make_service("name2")));

        assert!(store.service("ns", "name2").is_none());
        assert!(recorder.take().is_empty());

        cluster.apply_service(&Event::InitDone);

        assert!(store.service("ns", "name2").is_some());
        assert_eq!(recorder.take(), ["resync"]);
    }

    #[test]
    fn pod_lookups() {
        let mut cluster = Cluster::new();
        let store = cluster.store();

        cluster.apply_pod(&Event::Apply(make_pod("name1-1", "172.17.0.12")));

        assert!(store.pod("ns", "name1-1").is_some());
        assert!(store.pod("other", "name1-1").is_none());
        assert!(store.pod_by_ip("172.17.0.12".parse().unwrap()).is_some());
        assert!(store.pod_by_ip("172.17.0.13".parse().unwrap()).is_none());
    }

    #[test]
    fn backing_pod_by_reference_or_ip() {
        let mut cluster = Cluster::new();
        let store = cluster.store();
        cluster.apply_pod(&Event::Apply(make_pod("name1-1", "172.17.0.12")));

        let by_ref = EndpointAddress {
            ip: "172.17.0.12".to_string(),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some("name1-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let by_ip = EndpointAddress {
            ip: "172.17.0.12".to_string(),
            ..Default::default()
        };
        let missing = EndpointAddress {
            ip: "172.17.0.19".to_string(),
            ..Default::default()
        };

        assert_eq!(
            store.backing_pod("ns", &by_ref),
            Some(PodRef::new("ns", "name1-1"))
        );
        assert_eq!(
            store.backing_pod("ns", &by_ip),
            Some(PodRef::new("ns", "name1-1"))
        );
        assert_eq!(store.backing_pod("ns", &missing), None);
    }

    #[test]
    fn pod_by_ip_skips_terminated_pods() {
        let mut cluster = Cluster::new();
        let store = cluster.store();
        let ip = "10.0.0.7".parse().unwrap();

        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", "old-job", "Succeeded")));
        assert!(store.pod_by_ip(ip).is_none());

        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", "web-1", "Running")));
        assert_eq!(store.pod_by_ip(ip).unwrap().metadata.name.as_deref(), Some("web-1"));

        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", "web-1", "Failed")));
        assert!(store.pod_by_ip(ip).is_none());
    }

    #[test]
    fn shared_ip_keeps_first_seen_pod() {
        let mut cluster = Cluster::new();
        let store = cluster.store();
        let bare = EndpointAddress {
            ip: "10.0.0.7".to_string(),
            ..Default::default()
        };

        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", "web-1", "Running")));
        for i in 0..20 {
            let name = format!("hostnet-{i}");
            cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", &name, "Running")));
            assert_eq!(store.backing_pod("ns", &bare), Some(PodRef::new("ns", "web-1")));
        }

        // Updates that leave the IP alone do not reorder.
        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", "web-1", "Running")));
        assert_eq!(store.backing_pod("ns", &bare), Some(PodRef::new("ns", "web-1")));

        cluster.apply_pod(&Event::Delete(make_shared_ip_pod("ns", "web-1", "Running")));
        assert_eq!(store.backing_pod("ns", &bare), Some(PodRef::new("ns", "hostnet-0")));
    }

    #[test]
    fn shared_ip_prefers_endpoints_namespace() {
        let mut cluster = Cluster::new();
        let store = cluster.store();
        let bare = EndpointAddress {
            ip: "10.0.0.7".to_string(),
            ..Default::default()
        };

        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("kube-system", "agent", "Running")));
        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", "web-1", "Running")));

        assert_eq!(store.backing_pod("ns", &bare), Some(PodRef::new("ns", "web-1")));
        assert_eq!(store.backing_pod("other", &bare), Some(PodRef::new("kube-system", "agent")));
    }

    #[test]
    fn relist_keeps_pod_order_and_drops_missing_pods() {
        let mut cluster = Cluster::new();
        let store = cluster.store();
        let ip = "10.0.0.7".parse().unwrap();

        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", "web-2", "Running")));
        cluster.apply_pod(&Event::Apply(make_shared_ip_pod("ns", "web-1", "Running")));

        cluster.apply_pod(&Event::Init);
        cluster.apply_pod(&Event::InitApply(make_shared_ip_pod("ns", "web-1", "Running")));
        cluster.apply_pod(&Event::InitApply(make_shared_ip_pod("ns", "web-2", "Running")));
        cluster.apply_pod(&Event::InitDone);
        assert_eq!(store.pod_by_ip(ip).unwrap().metadata.name.as_deref(), Some("web-2"));

        cluster.apply_pod(&Event::Init);
        cluster.apply_pod(&Event::InitApply(make_shared_ip_pod("ns", "web-1", "Running")));
        cluster.apply_pod(&Event::InitDone);
        assert_eq!(store.pod_by_ip(ip).unwrap().metadata.name.as_deref(), Some("web-1"));

        cluster.apply_pod(&Event::Init);
        cluster.apply_pod(&Event::InitDone);
        assert!(store.pod_by_ip(ip).is_none());
    }

    #[tokio::test]
    async fn ready_after_every_kind_lists() {
        let mut cluster = Cluster::new();
        let store = cluster.store();

        cluster.apply_service(&Event::Init);
        cluster.apply_service(&Event::InitDone);
        cluster.apply_endpoints(&Event::Init);
        cluster.apply_endpoints(&Event::InitDone);

        let pending = tokio::time::timeout(Duration::from_millis(50), store.wait_until_ready());
        assert!(pending.await.is_err());

        cluster.apply_pod(&Event::Init);
        cluster.apply_pod(&Event::InitDone);

        let ready = tokio::time::timeout(Duration::from_secs(1), store.wait_until_ready());
        assert!(ready.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn ready_fails_when_cluster_dropped() {
        let cluster = Cluster::new();
        let store = cluster.store();
        drop(cluster);

        assert!(matches!(
            store.wait_until_ready().await,
            Err(Error::StoreClosed)
        ));
    }
}
