//! Process-wide table of capture instances.
//!
//! Slots are created at probe time and live for the process. Each carries
//! the stable name a session binds its upstream by; `mapped` marks the one
//! session currently holding it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{CaptureError, Result};
use crate::{RegistryConfig, CONFIG};

pub static REGISTRY: Lazy<Arc<InstanceRegistry>> =
    Lazy::new(|| Arc::new(InstanceRegistry::from_config(&CONFIG.load().registry)));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEntry {
    pub id: u32,
    pub name: String,
    pub mapped: bool,
}

/// A mapping handed to a session; give it back with [`InstanceRegistry::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub id: u32,
    pub name: String,
}

pub struct InstanceRegistry {
    slots: Mutex<Vec<Option<InstanceEntry>>>,
    prefix: String,
}

impl InstanceRegistry {
    /// Empty arena with room for `capacity` instances.
    pub fn new(capacity: u32, prefix: impl Into<String>) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity as usize]),
            prefix: prefix.into(),
        }
    }

    /// Arena with every slot probed.
    pub fn from_config(config: &RegistryConfig) -> Self {
        let registry = Self::new(config.instances, config.name_prefix.clone());
        for id in 0..config.instances {
            // ids are within capacity
            let _ = registry.alloc(id);
        }
        registry
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<InstanceEntry>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the instance at `id` if absent and return its name.
    pub fn alloc(&self, id: u32) -> Result<String> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(id as usize)
            .ok_or(CaptureError::OutOfRange(id as usize))?;
        let entry = slot.get_or_insert_with(|| InstanceEntry {
            id,
            name: format!("{}.{}", self.prefix, id),
            mapped: false,
        });
        Ok(entry.name.clone())
    }

    /// Map the instance at `id`; `Busy` if another session holds it.
    pub fn assign(&self, id: u32) -> Result<Assignment> {
        let mut slots = self.slots();
        let entry = slots
            .get_mut(id as usize)
            .ok_or(CaptureError::OutOfRange(id as usize))?
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidArgument(format!("instance {id} not allocated")))?;
        if entry.mapped {
            return Err(CaptureError::Busy("instance already mapped"));
        }
        entry.mapped = true;
        debug!("Assigned instance {}", entry.name);
        Ok(Assignment {
            id,
            name: entry.name.clone(),
        })
    }

    /// Map the lowest unmapped instance.
    pub fn assign_any(&self) -> Result<Assignment> {
        let mut slots = self.slots();
        let entry = slots
            .iter_mut()
            .flatten()
            .find(|entry| !entry.mapped)
            .ok_or(CaptureError::Busy("no free capture instance"))?;
        entry.mapped = true;
        debug!("Assigned instance {}", entry.name);
        Ok(Assignment {
            id: entry.id,
            name: entry.name.clone(),
        })
    }

    pub fn release(&self, id: u32) {
        let mut slots = self.slots();
        if let Some(Some(entry)) = slots.get_mut(id as usize) {
            if entry.mapped {
                entry.mapped = false;
                debug!("Released instance {}", entry.name);
            }
        }
    }

    pub fn is_mapped(&self, id: u32) -> bool {
        self.slots()
            .get(id as usize)
            .and_then(Option::as_ref)
            .is_some_and(|entry| entry.mapped)
    }

    pub fn entries(&self) -> Vec<InstanceEntry> {
        self.slots().iter().flatten().cloned().collect()
    }
}
