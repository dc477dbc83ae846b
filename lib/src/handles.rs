//! Reference counting of GEM handles.
//!
//! GEM handles are per file description. Importing a DMABUF of an object that is already known
//! hands back the handle we already hold, while opening a global name may return either a
//! tracked handle or a fresh one. Several [`crate::Buffer`]s can thus share one handle, and the
//! handle must only be closed once the last of them is gone.
use std::collections::HashMap;

use log::debug;

use crate::kernel::Kernel;
use crate::Result;

/// Number of live references to each GEM handle of a device.
///
/// The table lives behind the owning device's lock: every method expects the caller to hold it.
#[derive(Debug, Default)]
pub struct HandleTable {
    refs: HashMap<u32, u32>,
}

impl HandleTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a reference to `handle` and returns the new reference count.
    pub fn acquire(&mut self, handle: u32) -> u32 {
        let count = self.refs.entry(handle).or_insert(0);
        *count += 1;
        debug!("GEM handle {} acquired, {} reference(s)", handle, *count);

        *count
    }

    /// Drops a reference to `handle` and returns the remaining reference count.
    ///
    /// When the last reference goes away the entry is removed and `kernel` is asked to close
    /// the handle. If closing fails the error is returned, but the handle is forgotten anyway.
    ///
    /// # Panics
    ///
    /// If `handle` has no live reference.
    pub fn release<K: Kernel + ?Sized>(&mut self, kernel: &K, handle: u32) -> Result<u32> {
        let count = match self.refs.get_mut(&handle) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count
            }
            _ => panic!("releasing GEM handle {} which has no reference", handle),
        };

        if count > 0 {
            debug!("GEM handle {} released, {} reference(s)", handle, count);
            return Ok(count);
        }

        self.refs.remove(&handle);
        debug!("closing GEM handle {}", handle);
        kernel.close(handle)?;

        Ok(0)
    }

    /// Returns the number of references to `handle`, 0 if it is unknown.
    pub fn refcount(&self, handle: u32) -> u32 {
        self.refs.get(&handle).copied().unwrap_or(0)
    }

    /// Returns the number of distinct handles currently referenced.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
