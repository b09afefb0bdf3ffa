//! Resolution of `Endpoints` subsets into concrete, pod-backed addresses.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Pod};
use kube::ResourceExt;

use crate::addr::TcpAddress;
use crate::service::Port;

/// Identifies the pod backing an address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodRef {
    /// The pod's namespace.
    pub namespace: String,
    /// The pod's name.
    pub name: String,
}

impl PodRef {
    /// Creates a pod reference.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the reference of a pod object.
    #[must_use]
    pub fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A routable address currently valid for a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedAddress {
    /// The endpoint's IP and target port.
    pub addr: SocketAddr,
    /// The pod serving this address, if known.
    pub pod: Option<PodRef>,
}

impl ResolvedAddress {
    /// Creates an address without pod metadata.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, pod: None }
    }

    /// Attaches the backing pod's identity.
    #[must_use]
    pub fn with_pod(mut self, pod: PodRef) -> Self {
        self.pod = Some(pod);
        self
    }

    /// Encodes the address for the destination protocol.
    #[must_use]
    pub fn to_wire(&self) -> TcpAddress {
        TcpAddress::from(self.addr)
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

/// A set of resolved addresses. Ordering carries no meaning; the ordered set just keeps
/// deliveries deterministic.
pub type AddressSet = BTreeSet<ResolvedAddress>;

/// Resolves the addresses serving `target` across all subsets.
///
/// `lookup` returns the locally-known pod backing an address entry. Entries without one
/// are skipped: the pod may simply not have reached the local cache yet, and the entry
/// will resolve once it does. Entries with unparsable IPs are skipped as well.
pub fn resolve<F>(subsets: &[EndpointSubset], target: &Port, lookup: F) -> AddressSet
where
    F: Fn(&EndpointAddress) -> Option<PodRef>,
{
    let mut addrs = AddressSet::new();

    for subset in subsets {
        let Some(port) = subset_port(subset, target) else {
            continue;
        };

        for entry in subset.addresses.iter().flatten() {
            let Ok(ip) = entry.ip.parse::<IpAddr>() else {
                tracing::trace!("skipping endpoint with invalid IP {:?}", entry.ip);
                continue;
            };

            let Some(pod) = lookup(entry) else {
                tracing::trace!("skipping endpoint {ip}: backing pod not yet known");
                continue;
            };

            addrs.insert(ResolvedAddress::new(SocketAddr::new(ip, port)).with_pod(pod));
        }
    }

    addrs
}

/// Finds the port number a subset serves for `target`, if any.
fn subset_port(subset: &EndpointSubset, target: &Port) -> Option<u16> {
    subset
        .ports
        .as_ref()?
        .iter()
        .find(|p| match target {
            Port::Number(n) => p.port == i32::from(*n),
            Port::Name(name) => p.name.as_deref() == Some(name.as_str()),
        })
        .and_then(|p| u16::try_from(p.port).ok())
}

/// Returns the pod an address entry points at, if its target is a pod.
///
/// References without a namespace are taken to be in `namespace`, the namespace of the
/// `Endpoints` object.
pub(crate) fn pod_ref(entry: &EndpointAddress, namespace: &str) -> Option<PodRef> {
    let target = entry.target_ref.as_ref()?;

    if target.kind.as_deref().is_some_and(|kind| kind != "Pod") {
        return None;
    }

    Some(PodRef {
        namespace: target
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        name: target.name.clone()?,
    })
}

/// The pods referenced by an `Endpoints` object, whether or not they are known yet.
///
/// Used to decide which subscriptions a pod change can affect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Backing {
    pods: HashSet<PodRef>,
    ips: HashSet<IpAddr>,
}

impl Backing {
    pub(crate) fn of(subsets: &[EndpointSubset], namespace: &str) -> Self {
        let mut backing = Self::default();

        for entry in subsets.iter().flat_map(|s| s.addresses.iter().flatten()) {
            match pod_ref(entry, namespace) {
                Some(pod) => {
                    backing.pods.insert(pod);
                }
                None => {
                    if let Ok(ip) = entry.ip.parse() {
                        backing.ips.insert(ip);
                    }
                }
            }
        }

        backing
    }

    /// Pods referenced by name.
    pub(crate) fn pods(&self) -> impl Iterator<Item = &PodRef> {
        self.pods.iter()
    }

    /// Addresses without a pod reference, matched to pods by IP.
    pub(crate) fn ips(&self) -> impl Iterator<Item = &IpAddr> {
        self.ips.iter()
    }
}

pub(crate) fn pod_ip(pod: &Pod) -> Option<IpAddr> {
    pod.status.as_ref()?.pod_ip.as_ref()?.parse().ok()
}
