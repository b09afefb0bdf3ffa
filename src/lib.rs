#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes service discovery for data-plane proxies.
//!
//! A proxy asks "where do I send traffic for service X on port Y?". This crate answers
//! with the set of pod addresses currently serving that port, and keeps every subscriber's
//! answer accurate as `Service`, `Endpoints` and `Pod` resources change.
//!
//! # Features
//!
//! - **Local cluster state**: reflector stores fed by Kubernetes watches, with change
//!   callbacks per resource kind
//! - **Endpoint resolution**: service ports mapped to target ports (numeric or named), and
//!   endpoint addresses cross-checked against the pods known locally
//! - **Subscriptions**: an initial snapshot, then minimal add/remove diffs and explicit
//!   "no endpoints" signals that tell a missing service apart from an empty one
//! - **Address codec**: resolved addresses as destination-protocol `TcpAddress` messages
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use kube_destination::{Cluster, EndpointsWatcher, ServiceId, SyncConfig, Update, sync};
//!
//! // Build the stores and attach the watcher to them
//! let mut cluster = Cluster::new();
//! let watcher = Arc::new(EndpointsWatcher::new(cluster.store()));
//! cluster.register(&watcher);
//!
//! // Start watching the cluster
//! sync(cluster, SyncConfig::new());
//!
//! // Subscribe; updates arrive on the channel until the subscription is dropped
//! let (tx, mut rx) = mpsc::unbounded_channel::<Update>();
//! let subscription = watcher.subscribe(ServiceId::new("emojivoto", "web-svc"), 80, Arc::new(tx))?;
//!
//! while let Some(update) = rx.recv().await {
//!     // Translate into the response stream
//! }
//! ```

pub mod addr;
mod error;
mod k8s;
mod listener;
mod resolve;
mod service;
mod watcher;

pub use error::{Error, Result};
pub use k8s::{Cluster, ClusterStore, EventHandler, SyncConfig, sync, sync_with_client};
pub use listener::{Listener, Update};
pub use resolve::{AddressSet, PodRef, ResolvedAddress, resolve};
pub use service::{Port, ServiceId, ServiceKind, resolve_target_port, service_kind};
pub use watcher::{EndpointsWatcher, Subscription};
