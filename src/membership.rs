//! Locally cached membership shared by the instancer and the resolver.
//!
//! Both discovery paths rebuild the same [`Membership`] from either a full
//! prefix read ([`Membership::from_entries`]) or incremental watch events
//! ([`Membership::apply`]), and render it differently: the instancer as a
//! connection pool, the resolver as balance-channel changes.

use std::collections::BTreeMap;

use crate::record::InstanceRecord;
use crate::store::{KeyValue, StoreEvent};

/// A membership change produced by applying an event or a resync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipChange {
    /// An address joined `service`.
    Added {
        /// Service name.
        service: String,
        /// Joined address.
        address: String,
    },
    /// An address left `service`.
    Removed {
        /// Service name.
        service: String,
        /// Departed address.
        address: String,
    },
}

/// Service name to ordered, duplicate-free address list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Membership {
    services: BTreeMap<String, Vec<String>>,
}

impl Membership {
    /// Creates an empty membership.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a membership from a full prefix read, skipping unparseable values.
    #[must_use]
    pub fn from_entries(entries: &[KeyValue]) -> Self {
        let mut membership = Self::new();

        for kv in entries {
            match InstanceRecord::decode(&kv.value) {
                Ok(record) => {
                    membership.insert(record.name, record.address);
                }
                Err(e) => tracing::warn!("skipping {}: {e}", kv.key),
            }
        }

        membership
    }

    /// Applies one watch event, returning the resulting change if any.
    ///
    /// Puts for known addresses and deletes for unknown ones are no-ops.
    /// Unparseable events are skipped.
    pub fn apply(&mut self, namespace: &str, event: &StoreEvent) -> Option<MembershipChange> {
        match event {
            StoreEvent::Put(kv) => {
                let record = InstanceRecord::decode(&kv.value)
                    .inspect_err(|e| tracing::warn!("skipping put for {}: {e}", kv.key))
                    .ok()?;

                self.insert(record.name.clone(), record.address.clone())
                    .then(|| {
                        tracing::debug!("adding {} instance: {}", record.name, record.address);
                        MembershipChange::Added {
                            service: record.name,
                            address: record.address,
                        }
                    })
            }

            StoreEvent::Delete { key } => {
                let record = InstanceRecord::from_key(namespace, key)
                    .inspect_err(|e| tracing::warn!("skipping delete for {key}: {e}"))
                    .ok()?;

                self.remove(&record.name, &record.address).then(|| {
                    tracing::debug!("removing {} instance: {}", record.name, record.address);
                    MembershipChange::Removed {
                        service: record.name,
                        address: record.address,
                    }
                })
            }
        }
    }

    /// Replaces this view with `fresh`, returning the changes between them.
    ///
    /// Surviving addresses keep their position; joiners are appended in the
    /// order `fresh` lists them.
    pub fn reconcile(&mut self, fresh: &Self) -> Vec<MembershipChange> {
        let mut changes = Vec::new();

        for (service, addresses) in &self.services {
            let current = fresh.addresses(service);
            for address in addresses {
                if !current.contains(address) {
                    changes.push(MembershipChange::Removed {
                        service: service.clone(),
                        address: address.clone(),
                    });
                }
            }
        }

        for (service, addresses) in &fresh.services {
            let known = self.addresses(service);
            for address in addresses {
                if !known.contains(address) {
                    changes.push(MembershipChange::Added {
                        service: service.clone(),
                        address: address.clone(),
                    });
                }
            }
        }

        for change in &changes {
            match change {
                MembershipChange::Added { service, address } => {
                    self.insert(service.clone(), address.clone());
                }
                MembershipChange::Removed { service, address } => {
                    self.remove(service, address);
                }
            }
        }

        changes
    }

    /// Returns the known addresses of `service`.
    #[must_use]
    pub fn addresses(&self, service: &str) -> &[String] {
        self.services.get(service).map_or(&[], Vec::as_slice)
    }

    /// Iterates over services and their addresses, ordered by service name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.services
            .iter()
            .map(|(service, addresses)| (service.as_str(), addresses.as_slice()))
    }

    /// Returns `true` if no instance is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Returns the number of known instances across all services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    fn insert(&mut self, service: String, address: String) -> bool {
        let addresses = self.services.entry(service).or_default();
        if addresses.contains(&address) {
            false
        } else {
            addresses.push(address);
            true
        }
    }

    fn remove(&mut self, service: &str, address: &str) -> bool {
        let Some(addresses) = self.services.get_mut(service) else {
            return false;
        };

        let before = addresses.len();
        addresses.retain(|a| a != address);
        let removed = addresses.len() != before;

        if addresses.is_empty() {
            self.services.remove(service);
        }

        removed
    }
}
