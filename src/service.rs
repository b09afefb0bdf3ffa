//! Service identities, requested ports and target-port resolution.

use std::fmt;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::error::{Error, Result};

/// Identifies a logical service by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    /// The namespace the service lives in.
    pub namespace: String,
    /// The service name.
    pub name: String,
}

impl ServiceId {
    /// Creates a service identity.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the identity of a namespaced object such as a `Service` or `Endpoints`.
    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_label("namespace", &self.namespace)?;
        validate_label("service name", &self.name)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// Namespaces and service names are RFC 1123 labels.
fn validate_label(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Subscription(format!("{what} is empty")));
    }

    if value.len() > 63 {
        return Err(Error::Subscription(format!(
            "{what} {value:?} is longer than 63 characters"
        )));
    }

    let valid_chars = value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    let alnum_ends = !value.starts_with('-') && !value.ends_with('-');

    if valid_chars && alnum_ends {
        Ok(())
    } else {
        Err(Error::Subscription(format!(
            "{what} {value:?} is not a valid DNS label"
        )))
    }
}

/// A service port, given either as a number or by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named port.
    Name(String),
}

impl Port {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Self::Number(0) => Err(Error::Subscription("port 0 is not routable".to_string())),
            Self::Name(name) if name.is_empty() => {
                Err(Error::Subscription("port name is empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl TryFrom<u32> for Port {
    type Error = Error;

    fn try_from(port: u32) -> Result<Self> {
        match u16::try_from(port) {
            Ok(0) | Err(_) => Err(Error::Subscription(format!(
                "port {port} is not a valid TCP port"
            ))),
            Ok(port) => Ok(Self::Number(port)),
        }
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// How a service is addressed inside the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    /// The service is backed by endpoints with cluster-internal addresses.
    ClusterAddressed,
    /// An `ExternalName` service: a DNS alias with no cluster-internal endpoints.
    ExternallyAliased,
}

/// Classifies a service by its `spec.type`.
#[must_use]
pub fn service_kind(service: &Service) -> ServiceKind {
    let type_ = service.spec.as_ref().and_then(|s| s.type_.as_deref());

    if type_ == Some("ExternalName") {
        ServiceKind::ExternallyAliased
    } else {
        ServiceKind::ClusterAddressed
    }
}

/// Determines which endpoint port serves a requested service port.
///
/// If the service declares the requested port with a `targetPort`, that target is
/// returned (numeric or named). A port declared without a mapping, or not declared at
/// all, maps to itself; a requested name that matches a declared port without a mapping
/// resolves to that port's number.
#[must_use]
pub fn resolve_target_port(service: &Service, port: &Port) -> Port {
    let declared = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| {
            ports.iter().find(|p| match port {
                Port::Number(n) => p.port == i32::from(*n),
                Port::Name(name) => p.name.as_deref() == Some(name.as_str()),
            })
        });

    let Some(declared) = declared else {
        return port.clone();
    };

    match &declared.target_port {
        Some(IntOrString::Int(target)) if *target != 0 => {
            u16::try_from(*target).map_or_else(|_| port.clone(), Port::Number)
        }
        Some(IntOrString::String(target)) if !target.is_empty() => Port::Name(target.clone()),
        _ => match port {
            Port::Name(_) => u16::try_from(declared.port).map_or_else(|_| port.clone(), Port::Number),
            Port::Number(_) => port.clone(),
        },
    }
}
