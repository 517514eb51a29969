//! Handle tables
//!
//! Every resource family exposed to guest code (audio channels, files,
//! sockets, apps) lives in its own `HandleTable`. Handles are dense slot
//! indices: the first free slot is reused before the array grows, so the
//! values stay small and match the numbering guests expect.

use om_core::error::KernelError;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::trace;

/// Guest-visible handle value
pub type Handle = i32;

/// Returned to the guest when a handle could not be issued
pub const INVALID_HANDLE: Handle = -1;

/// Collapse a handle result into the guest calling convention
pub fn to_guest<E>(result: Result<Handle, E>) -> i32 {
    result.unwrap_or(INVALID_HANDLE)
}

struct Slot<T, K> {
    resource: T,
    key: Option<K>,
}

/// Slot-based registry of live resources
///
/// `K` is the identity key used to detect repeated requests for the same
/// source; tables that never replace in place use the default `()`.
pub struct HandleTable<T, K = ()> {
    name: &'static str,
    slots: RwLock<Vec<Option<Slot<T, K>>>>,
    limit: Option<usize>,
}

impl<T, K> HandleTable<T, K> {
    /// Create an unbounded table
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: RwLock::new(Vec::new()),
            limit: None,
        }
    }

    /// Create a table holding at most `limit` live resources
    pub fn with_limit(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            slots: RwLock::new(Vec::new()),
            limit: Some(limit),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn index(handle: Handle) -> Option<usize> {
        usize::try_from(handle).ok()
    }

    /// Place a slot at the first empty index, growing the array if needed
    fn insert(&self, slots: &mut Vec<Option<Slot<T, K>>>, slot: Slot<T, K>) -> Result<Handle, KernelError> {
        if let Some(limit) = self.limit {
            let active = slots.iter().filter(|s| s.is_some()).count();
            if active >= limit {
                trace!("{}: limit of {} handles reached", self.name, limit);
                return Err(KernelError::ResourceLimit);
            }
        }

        let free = slots.iter().position(Option::is_none);
        let index = free.unwrap_or(slots.len());
        let handle = Handle::try_from(index).map_err(|_| KernelError::ResourceLimit)?;

        match free {
            Some(index) => slots[index] = Some(slot),
            None => slots.push(Some(slot)),
        }

        trace!("{}: issued handle {}", self.name, handle);
        Ok(handle)
    }

    /// Register a resource without an identity key
    pub fn push(&self, resource: T) -> Result<Handle, KernelError> {
        let mut slots = self.slots.write();
        self.insert(&mut slots, Slot { resource, key: None })
    }

    /// Register a resource under an identity key
    pub fn push_keyed(&self, key: K, resource: T) -> Result<Handle, KernelError> {
        let mut slots = self.slots.write();
        self.insert(
            &mut slots,
            Slot {
                resource,
                key: Some(key),
            },
        )
    }

    /// Check whether a handle refers to a live resource
    pub fn is_active(&self, handle: Handle) -> bool {
        Self::index(handle)
            .and_then(|index| self.slots.read().get(index).map(Option::is_some))
            .unwrap_or(false)
    }

    /// Borrow a live resource
    ///
    /// The table stays read-locked while the guard is held.
    pub fn access(&self, handle: Handle) -> Result<MappedRwLockReadGuard<'_, T>, KernelError> {
        let index = Self::index(handle).ok_or(KernelError::InvalidHandle(handle))?;
        RwLockReadGuard::try_map(self.slots.read(), |slots| {
            slots.get(index).and_then(Option::as_ref).map(|slot| &slot.resource)
        })
        .map_err(|_| KernelError::InvalidHandle(handle))
    }

    /// Mutably borrow a live resource
    pub fn access_mut(&self, handle: Handle) -> Result<MappedRwLockWriteGuard<'_, T>, KernelError> {
        let index = Self::index(handle).ok_or(KernelError::InvalidHandle(handle))?;
        RwLockWriteGuard::try_map(self.slots.write(), |slots| {
            slots
                .get_mut(index)
                .and_then(Option::as_mut)
                .map(|slot| &mut slot.resource)
        })
        .map_err(|_| KernelError::InvalidHandle(handle))
    }

    /// Empty a slot, handing the resource back to the caller
    ///
    /// Returns `None` for inactive handles.
    pub fn remove(&self, handle: Handle) -> Option<T> {
        let index = Self::index(handle)?;
        let slot = self.slots.write().get_mut(index)?.take()?;
        trace!("{}: released handle {}", self.name, handle);
        Some(slot.resource)
    }

    /// Discard every slot, invalidating all issued handles
    ///
    /// The resources are returned so they can be torn down without the
    /// table lock held.
    pub fn reset_all(&self) -> Vec<T> {
        let slots = std::mem::take(&mut *self.slots.write());
        let resources: Vec<T> = slots.into_iter().flatten().map(|slot| slot.resource).collect();
        trace!("{}: reset, {} resources released", self.name, resources.len());
        resources
    }

    /// Handles of all live resources, in ascending order
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .filter_map(|(index, _)| Handle::try_from(index).ok())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }
}

impl<T, K: PartialEq> HandleTable<T, K> {
    /// Find the live handle registered under `key`
    pub fn find_key(&self, key: &K) -> Option<Handle> {
        self.slots
            .read()
            .iter()
            .position(|slot| matches!(slot, Some(Slot { key: Some(k), .. }) if k == key))
            .and_then(|index| Handle::try_from(index).ok())
    }

    /// Register a resource, reusing the handle of a live resource with the
    /// same key
    ///
    /// When a match exists the new resource takes its slot and the displaced
    /// one is returned for the caller to stop. The handle value is unchanged.
    pub fn replace_or_push(&self, key: K, resource: T) -> Result<(Handle, Option<T>), KernelError> {
        let mut slots = self.slots.write();

        let existing = slots
            .iter()
            .position(|slot| matches!(slot, Some(Slot { key: Some(k), .. }) if *k == key));

        match existing {
            Some(index) => {
                let handle = Handle::try_from(index).map_err(|_| KernelError::ResourceLimit)?;
                let slot = slots[index].replace(Slot {
                    resource,
                    key: Some(key),
                });
                trace!("{}: replaced resource at handle {}", self.name, handle);
                Ok((handle, slot.map(|s| s.resource)))
            }
            None => {
                let handle = self.insert(
                    &mut slots,
                    Slot {
                        resource,
                        key: Some(key),
                    },
                )?;
                Ok((handle, None))
            }
        }
    }
}

impl<T, K> std::fmt::Debug for HandleTable<T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("name", &self.name)
            .field("active", &self.active_count())
            .field("limit", &self.limit)
            .finish()
    }
}
