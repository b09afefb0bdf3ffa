//! The callback surface a subscriber implements.

use tokio::sync::mpsc::UnboundedSender;

use crate::resolve::AddressSet;

/// Receives address updates for one subscription.
///
/// Calls for a single subscription are never concurrent. They are made while the
/// registry holds the service's lock, so implementations must return promptly. Subscribing
/// to, cancelling or dropping a subscription of the same service from inside a callback
/// panics.
pub trait Listener: Send + Sync {
    /// Addresses that became available. Never called with an empty set.
    fn add(&self, addrs: &AddressSet);

    /// Addresses that are no longer available. Never called with an empty set.
    fn remove(&self, addrs: &AddressSet);

    /// The service currently has no routable addresses.
    ///
    /// `exists` is false when the service is unknown (or only an external DNS alias) and
    /// true when it exists without ready endpoints.
    fn no_endpoints(&self, exists: bool);
}

/// A single listener callback, as a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    /// See [`Listener::add`].
    Add(AddressSet),
    /// See [`Listener::remove`].
    Remove(AddressSet),
    /// See [`Listener::no_endpoints`].
    NoEndpoints {
        /// Whether the service exists.
        exists: bool,
    },
}

/// Forwards callbacks into a channel, e.g. one drained by a response stream.
///
/// A closed channel is ignored; whoever dropped the receiver is expected to cancel the
/// subscription.
impl Listener for UnboundedSender<Update> {
    fn add(&self, addrs: &AddressSet) {
        forward(self, Update::Add(addrs.clone()));
    }

    fn remove(&self, addrs: &AddressSet) {
        forward(self, Update::Remove(addrs.clone()));
    }

    fn no_endpoints(&self, exists: bool) {
        forward(self, Update::NoEndpoints { exists });
    }
}

fn forward(tx: &UnboundedSender<Update>, update: Update) {
    if tx.send(update).is_err() {
        tracing::warn!("listener channel closed, dropping update");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::resolve::ResolvedAddress;

    #[test]
    fn channel_listener_forwards_updates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addrs: AddressSet = [ResolvedAddress::new("10.0.0.1:80".parse().unwrap())]
            .into_iter()
            .collect();

        tx.add(&addrs);
        tx.remove(&addrs);
        tx.no_endpoints(true);

        assert_eq!(rx.try_recv().unwrap(), Update::Add(addrs.clone()));
        assert_eq!(rx.try_recv().unwrap(), Update::Remove(addrs));
        assert_eq!(rx.try_recv().unwrap(), Update::NoEndpoints { exists: true });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_listener_ignores_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        tx.no_endpoints(false);
    }
}
