//! Subscription registry and fan-out of endpoint changes.
//!
//! The [`EndpointsWatcher`] keeps one publisher per subscribed service. Each publisher
//! holds, for every subscribed port, the address set last delivered to that port's
//! listeners. Whenever the store reports a change that can affect the service (its
//! `Service` or `Endpoints` object, or a pod its endpoints refer to), the publisher
//! recomputes every port from the store and delivers the difference.
//!
//! All work for one service happens under that service's lock: deliveries to its
//! listeners are serialized, and a subscription cancelled under the lock never hears
//! from the watcher again. Unrelated services never contend. A pod change locks only the
//! services whose endpoints refer to that pod.
//!
//! Subscribing never waits for the store's initial listing. A subscriber gets whatever
//! the store holds at that moment; once a listing completes, every subscribed service is
//! recomputed and any correction arrives as an ordinary update.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints, Pod, Service};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::Result;
use crate::k8s::{ClusterStore, EventHandler};
use crate::listener::Listener;
use crate::resolve::{AddressSet, Backing, PodRef, pod_ip, resolve};
use crate::service::{Port, ServiceId, ServiceKind, resolve_target_port, service_kind};

type SharedPublisher = Arc<Mutex<ServicePublisher>>;

thread_local! {
    // Publishers locked by this thread, which may be calling their listeners.
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Locks `publisher` for the current thread.
///
/// # Panics
///
/// Panics instead of deadlocking if this thread already holds the lock, which happens
/// when a listener subscribes to or cancels a subscription of the service it is being
/// called for.
fn lock(publisher: &SharedPublisher) -> Locked<'_> {
    let key = Arc::as_ptr(publisher).addr();
    assert!(
        !HELD.with_borrow(|held| held.contains(&key)),
        "listener callback changed a subscription to its own service"
    );

    let guard = publisher.lock();
    HELD.with_borrow_mut(|held| held.push(key));
    Locked { guard, key }
}

struct Locked<'a> {
    guard: MutexGuard<'a, ServicePublisher>,
    key: usize,
}

impl Deref for Locked<'_> {
    type Target = ServicePublisher;

    fn deref(&self) -> &ServicePublisher {
        &self.guard
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut ServicePublisher {
        &mut self.guard
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        HELD.with_borrow_mut(|held| held.retain(|key| *key != self.key));
    }
}

/// Subscribed services by the pods their endpoints refer to.
#[derive(Default)]
struct Dependents {
    pods: HashMap<PodRef, HashSet<ServiceId>>,
    ips: HashMap<IpAddr, HashSet<ServiceId>>,
}

impl Dependents {
    fn replace(&mut self, service: &ServiceId, old: &Backing, new: &Backing) {
        for pod in old.pods() {
            unlink(&mut self.pods, pod, service);
        }
        for ip in old.ips() {
            unlink(&mut self.ips, ip, service);
        }

        for pod in new.pods() {
            self.pods.entry(pod.clone()).or_default().insert(service.clone());
        }
        for ip in new.ips() {
            self.ips.entry(*ip).or_default().insert(service.clone());
        }
    }

    fn services_of(&self, pods: &[&Pod]) -> HashSet<ServiceId> {
        let mut services = HashSet::new();

        for pod in pods {
            if let Some(found) = self.pods.get(&PodRef::of(pod)) {
                services.extend(found.iter().cloned());
            }
            if let Some(found) = pod_ip(pod).and_then(|ip| self.ips.get(&ip)) {
                services.extend(found.iter().cloned());
            }
        }

        services
    }
}

fn unlink<K>(index: &mut HashMap<K, HashSet<ServiceId>>, key: &K, service: &ServiceId)
where
    K: Eq + std::hash::Hash,
{
    if let Some(services) = index.get_mut(key) {
        services.remove(service);
        if services.is_empty() {
            index.remove(key);
        }
    }
}

/// Resolves services into endpoint addresses and keeps subscribers up to date.
///
/// Register the watcher with the [`Cluster`](crate::Cluster) whose store it reads, so
/// that it hears about changes.
pub struct EndpointsWatcher {
    store: ClusterStore,
    services: RwLock<HashMap<ServiceId, SharedPublisher>>,
    dependents: Arc<RwLock<Dependents>>,
    next_id: AtomicU64,
}

impl EndpointsWatcher {
    /// Creates a watcher reading from `store`.
    #[must_use]
    pub fn new(store: ClusterStore) -> Self {
        Self {
            store,
            services: RwLock::new(HashMap::new()),
            dependents: Arc::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribes `listener` to the addresses of `service` on `port`.
    ///
    /// The current state is delivered before this returns: one `add` call with every
    /// address, or a `no_endpoints` call if there are none. Later changes follow as
    /// `add`/`remove` diffs until the returned [`Subscription`] is cancelled or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Subscription`](crate::Error::Subscription) if the service
    /// identity or port is malformed. A service that does not exist is not an error.
    ///
    /// # Panics
    ///
    /// Panics if called from a listener callback of a subscription to the same service.
    pub fn subscribe(
        &self,
        service: ServiceId,
        port: impl Into<Port>,
        listener: Arc<dyn Listener>,
    ) -> Result<Subscription> {
        let port = port.into();
        service.validate()?;
        port.validate()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let publisher = self.publisher(&service);
        lock(&publisher).subscribe(&self.store, &port, id, listener);

        tracing::debug!("subscribed to {service} on port {port}");
        Ok(Subscription {
            publisher,
            port,
            id,
        })
    }

    fn publisher(&self, service: &ServiceId) -> SharedPublisher {
        if let Some(publisher) = self.services.read().get(service) {
            return publisher.clone();
        }

        self.services
            .write()
            .entry(service.clone())
            .or_insert_with(|| {
                let publisher = ServicePublisher::new(service.clone(), self.dependents.clone());
                Arc::new(Mutex::new(publisher))
            })
            .clone()
    }

    fn publishers(&self) -> Vec<SharedPublisher> {
        self.services.read().values().cloned().collect()
    }

    fn update_service(&self, service: &ServiceId) {
        let publisher = self.services.read().get(service).cloned();

        if let Some(publisher) = publisher {
            let mut publisher = lock(&publisher);

            if publisher.is_subscribed() {
                publisher.refresh(&self.store);
            }
        }
    }

    fn update_pods(&self, pods: &[&Pod]) {
        let services = self.dependents.read().services_of(pods);

        for service in &services {
            self.update_service(service);
        }
    }

    fn update_all(&self) {
        for publisher in self.publishers() {
            let mut publisher = lock(&publisher);

            if publisher.is_subscribed() {
                publisher.refresh(&self.store);
            }
        }
    }
}

impl EventHandler<Service> for EndpointsWatcher {
    fn on_add(&self, service: &Service) {
        self.update_service(&ServiceId::of(service));
    }

    fn on_update(&self, _old: &Service, new: &Service) {
        self.update_service(&ServiceId::of(new));
    }

    fn on_delete(&self, service: &Service) {
        self.update_service(&ServiceId::of(service));
    }

    fn on_resync(&self) {
        self.update_all();
    }
}

impl EventHandler<Endpoints> for EndpointsWatcher {
    fn on_add(&self, endpoints: &Endpoints) {
        self.update_service(&ServiceId::of(endpoints));
    }

    fn on_update(&self, _old: &Endpoints, new: &Endpoints) {
        self.update_service(&ServiceId::of(new));
    }

    fn on_delete(&self, endpoints: &Endpoints) {
        self.update_service(&ServiceId::of(endpoints));
    }

    fn on_resync(&self) {
        self.update_all();
    }
}

impl EventHandler<Pod> for EndpointsWatcher {
    fn on_add(&self, pod: &Pod) {
        self.update_pods(&[pod]);
    }

    // The old pod matters too: an IP change can move it out of an endpoint set.
    fn on_update(&self, old: &Pod, new: &Pod) {
        self.update_pods(&[old, new]);
    }

    fn on_delete(&self, pod: &Pod) {
        self.update_pods(&[pod]);
    }

    fn on_resync(&self) {
        self.update_all();
    }
}

/// An active subscription. Dropping it cancels the subscription.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    publisher: SharedPublisher,
    port: Port,
    id: u64,
}

impl Subscription {
    /// Stops delivery to the listener.
    ///
    /// Once this returns, the listener is not called again, even by an update that was
    /// being computed concurrently. Cancelling more than once has no further effect.
    ///
    /// # Panics
    ///
    /// Panics if called (or the subscription dropped) from a listener callback of a
    /// subscription to the same service.
    pub fn cancel(&self) {
        lock(&self.publisher).unsubscribe(&self.port, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Per-service subscription state.
struct ServicePublisher {
    service: ServiceId,
    /// Pods referenced by the service's endpoints when last refreshed.
    backing: Backing,
    dependents: Arc<RwLock<Dependents>>,
    ports: HashMap<Port, PortPublisher>,
}

impl ServicePublisher {
    fn new(service: ServiceId, dependents: Arc<RwLock<Dependents>>) -> Self {
        Self {
            service,
            backing: Backing::default(),
            dependents,
            ports: HashMap::new(),
        }
    }

    fn is_subscribed(&self) -> bool {
        !self.ports.is_empty()
    }

    fn subscribe(
        &mut self,
        store: &ClusterStore,
        port: &Port,
        id: u64,
        listener: Arc<dyn Listener>,
    ) {
        // Bring existing listeners up to date first so every listener on a port shares
        // the same view.
        let snapshot = self.refresh(store);

        let service = &self.service;
        let publisher = self
            .ports
            .entry(port.clone())
            .or_insert_with(|| PortPublisher::new(snapshot.state(store, service, port)));

        Diff::initial(&publisher.state).deliver(listener.as_ref());
        publisher.listeners.push((id, listener));
    }

    fn unsubscribe(&mut self, port: &Port, id: u64) {
        let Some(publisher) = self.ports.get_mut(port) else {
            return;
        };

        publisher.listeners.retain(|(other, _)| *other != id);

        if publisher.listeners.is_empty() {
            self.ports.remove(port);
            tracing::debug!("no more subscribers for {} on port {port}", self.service);
        }

        if !self.is_subscribed() {
            self.set_backing(Backing::default());
        }
    }

    fn set_backing(&mut self, backing: Backing) {
        if backing != self.backing {
            self.dependents
                .write()
                .replace(&self.service, &self.backing, &backing);
            self.backing = backing;
        }
    }

    /// Recomputes every subscribed port from the store and delivers the changes.
    fn refresh(&mut self, store: &ClusterStore) -> Snapshot {
        let snapshot = Snapshot::load(store, &self.service);

        // Indexed before pods are read, so a pod arriving in between still triggers a
        // refresh.
        self.set_backing(Backing::of(snapshot.subsets(), &self.service.namespace));

        for (port, publisher) in &mut self.ports {
            let next = snapshot.state(store, &self.service, port);
            publisher.update(next, &self.service, port);
        }

        snapshot
    }
}

/// The objects describing a service at one point in time.
struct Snapshot {
    service: Option<Arc<Service>>,
    endpoints: Option<Arc<Endpoints>>,
}

impl Snapshot {
    fn load(store: &ClusterStore, service: &ServiceId) -> Self {
        Self {
            service: store.service(&service.namespace, &service.name),
            endpoints: store.endpoints(&service.namespace, &service.name),
        }
    }

    fn subsets(&self) -> &[EndpointSubset] {
        self.endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.subsets.as_deref())
            .unwrap_or_default()
    }

    fn state(&self, store: &ClusterStore, id: &ServiceId, port: &Port) -> PortState {
        let Some(service) = &self.service else {
            return PortState::Absent;
        };

        if service_kind(service) == ServiceKind::ExternallyAliased {
            return PortState::Aliased;
        }

        let target = resolve_target_port(service, port);
        let addrs = resolve(self.subsets(), &target, |entry| {
            store.backing_pod(&id.namespace, entry)
        });

        PortState::Resolved(addrs)
    }
}

/// What a subscription to one port currently sees.
#[derive(Clone, Debug, PartialEq, Eq)]
enum PortState {
    /// No `Service` object exists.
    Absent,
    /// An `ExternalName` service; resolved through DNS rather than endpoints.
    Aliased,
    /// The service exists and these addresses serve the port.
    Resolved(AddressSet),
}

impl PortState {
    fn addresses(&self) -> Option<&AddressSet> {
        match self {
            Self::Resolved(addrs) => Some(addrs),
            Self::Absent | Self::Aliased => None,
        }
    }

    // Aliased services report as nonexistent so that clients fall back to DNS.
    fn exists(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

/// Listeners of one (service, port) pair and the state they have been shown.
struct PortPublisher {
    state: PortState,
    listeners: Vec<(u64, Arc<dyn Listener>)>,
}

impl PortPublisher {
    fn new(state: PortState) -> Self {
        Self {
            state,
            listeners: Vec::new(),
        }
    }

    fn update(&mut self, next: PortState, service: &ServiceId, port: &Port) {
        if next == self.state {
            return;
        }

        let diff = Diff::between(&self.state, &next);
        self.state = next;

        tracing::debug!(
            "{service} on port {port}: {} added, {} removed, {} listeners",
            diff.added.len(),
            diff.removed.len(),
            self.listeners.len()
        );

        for (_, listener) in &self.listeners {
            diff.deliver(listener.as_ref());
        }
    }
}

/// The calls that move a listener from one state to another.
#[derive(Debug, Default, PartialEq, Eq)]
struct Diff {
    added: AddressSet,
    removed: AddressSet,
    no_endpoints: Option<bool>,
}

impl Diff {
    fn initial(state: &PortState) -> Self {
        let added = state.addresses().cloned().unwrap_or_default();
        let no_endpoints = added.is_empty().then_some(state.exists());

        Self {
            added,
            removed: AddressSet::new(),
            no_endpoints,
        }
    }

    fn between(prev: &PortState, next: &PortState) -> Self {
        let empty = AddressSet::new();
        let prev_addrs = prev.addresses().unwrap_or(&empty);
        let next_addrs = next.addresses().unwrap_or(&empty);

        let emptied = next_addrs.is_empty()
            && (!prev_addrs.is_empty() || prev.exists() != next.exists());

        Self {
            added: next_addrs.difference(prev_addrs).cloned().collect(),
            removed: prev_addrs.difference(next_addrs).cloned().collect(),
            no_endpoints: emptied.then_some(next.exists()),
        }
    }

    fn deliver(&self, listener: &dyn Listener) {
        if !self.removed.is_empty() {
            listener.remove(&self.removed);
        }

        if !self.added.is_empty() {
            listener.add(&self.added);
        }

        if let Some(exists) = self.no_endpoints {
            listener.no_endpoints(exists);
        }
    }
}
