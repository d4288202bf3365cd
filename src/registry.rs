//! Provider Descriptor Registry.
//!
//! ## Responsibility
//! Own the set of registered [`ProviderDescriptor`]s and hand out stable,
//! priority-ordered snapshots to the dispatch loop.
//!
//! ## Guarantees
//! - Snapshots are immutable `Arc` slices; a dispatch that took one is never
//!   affected by a concurrent `register`/`replace_all`.
//! - Ordering is `priority` ascending, then insertion order.
//! - `replace_all` is atomic: readers see either the old set or the new set.
//!
//! ## NOT Responsible For
//! - Health state (that belongs to `health`)
//! - Invoking providers (that belongs to `invoker`)

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::provider::ProviderDescriptor;
use crate::DispatchError;

#[derive(Debug)]
struct RegistryState {
    /// Sorted view handed to readers.
    snapshot: Arc<[ProviderDescriptor]>,
    /// Descriptors with their insertion sequence, in insertion order.
    entries: Vec<(u64, ProviderDescriptor)>,
    next_seq: u64,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            snapshot: Arc::from(Vec::new()),
            entries: Vec::new(),
            next_seq: 0,
        }
    }
}

impl RegistryState {
    fn rebuild_snapshot(&mut self) {
        let mut sorted: Vec<&(u64, ProviderDescriptor)> = self.entries.iter().collect();
        sorted.sort_by_key(|(seq, d)| (d.priority, *seq));
        self.snapshot = sorted.into_iter().map(|(_, d)| d.clone()).collect();
    }
}

/// Process-wide set of registered providers.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    state: RwLock<RegistryState>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with `descriptors`, in order.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateProvider`] if two descriptors share an id.
    pub fn with_providers(
        descriptors: impl IntoIterator<Item = ProviderDescriptor>,
    ) -> Result<Self, DispatchError> {
        let registry = Self::new();
        registry.replace_all(descriptors)?;
        Ok(registry)
    }

    /// Register one provider.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateProvider`] if `descriptor.id` is already present.
    pub fn register(&self, descriptor: ProviderDescriptor) -> Result<(), DispatchError> {
        let mut state = self.state.write();
        if state.entries.iter().any(|(_, d)| d.id == descriptor.id) {
            return Err(DispatchError::DuplicateProvider(descriptor.id));
        }
        info!(
            provider = %descriptor.id,
            priority = descriptor.priority,
            backend = descriptor.backend.as_str(),
            "registry: provider registered"
        );
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push((seq, descriptor));
        state.rebuild_snapshot();
        Ok(())
    }

    /// Remove a provider.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownProvider`] if no provider has this id.
    pub fn deregister(&self, id: &str) -> Result<ProviderDescriptor, DispatchError> {
        let mut state = self.state.write();
        let pos = state
            .entries
            .iter()
            .position(|(_, d)| d.id == id)
            .ok_or_else(|| DispatchError::UnknownProvider(id.to_string()))?;
        let (_, removed) = state.entries.remove(pos);
        state.rebuild_snapshot();
        info!(provider = %id, "registry: provider deregistered");
        Ok(removed)
    }

    /// Atomically replace the whole provider set.
    ///
    /// The new set is validated before anything is swapped, so a rejected
    /// call leaves the registry untouched.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateProvider`] if the new set repeats an id.
    pub fn replace_all(
        &self,
        descriptors: impl IntoIterator<Item = ProviderDescriptor>,
    ) -> Result<(), DispatchError> {
        let descriptors: Vec<ProviderDescriptor> = descriptors.into_iter().collect();
        let mut seen = HashSet::with_capacity(descriptors.len());
        for d in &descriptors {
            if !seen.insert(d.id.as_str()) {
                return Err(DispatchError::DuplicateProvider(d.id.clone()));
            }
        }

        let mut state = self.state.write();
        let base = state.next_seq;
        let count = descriptors.len() as u64;
        state.entries = descriptors
            .into_iter()
            .enumerate()
            .map(|(i, d)| (base + i as u64, d))
            .collect();
        state.next_seq = base + count;
        state.rebuild_snapshot();
        info!(providers = count, "registry: provider set replaced");
        Ok(())
    }

    /// Priority-ordered snapshot. Never mutated after it is returned.
    pub fn list(&self) -> Arc<[ProviderDescriptor]> {
        Arc::clone(&self.state.read().snapshot)
    }

    /// Look up one provider by id.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownProvider`] if absent.
    pub fn get(&self, id: &str) -> Result<ProviderDescriptor, DispatchError> {
        self.state
            .read()
            .entries
            .iter()
            .find(|(_, d)| d.id == id)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| DispatchError::UnknownProvider(id.to_string()))
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
