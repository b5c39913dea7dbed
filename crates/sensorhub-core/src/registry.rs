//! Named buffer lookup: the seam every producer and reader stage uses to find
//! the ring buffer of a channel.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::ring::BroadcastBuffer;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("buffer {0:?} is already registered")]
    Duplicate(String),

    #[error("no buffer named {0:?}")]
    NotFound(String),

    #[error("buffer {name:?} holds {actual} samples, not {requested}")]
    TypeMismatch {
        name: String,
        requested: &'static str,
        actual: &'static str,
    },
}

struct Entry {
    buffer: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Registry of ring buffers keyed by channel name.
#[derive(Default)]
pub struct BufferRegistry {
    buffers: Mutex<HashMap<String, Entry>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `buffer` under `name`. Names are unique.
    pub fn register<T>(&self, name: &str, buffer: BroadcastBuffer<T>) -> Result<(), RegistryError>
    where
        T: Copy + Default + Send + 'static,
    {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        buffers.insert(
            name.to_string(),
            Entry {
                buffer: Arc::new(buffer),
                type_name: std::any::type_name::<T>(),
            },
        );
        Ok(())
    }

    /// Look up the buffer registered as `name`, checking its sample type.
    pub fn find_buffer<T>(&self, name: &str) -> Result<BroadcastBuffer<T>, RegistryError>
    where
        T: Copy + Default + Send + 'static,
    {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = buffers
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry
            .buffer
            .downcast_ref::<BroadcastBuffer<T>>()
            .cloned()
            .ok_or_else(|| RegistryError::TypeMismatch {
                name: name.to_string(),
                requested: std::any::type_name::<T>(),
                actual: entry.type_name,
            })
    }

    /// Remove a buffer from the registry. Existing handles stay valid.
    pub fn unregister(&self, name: &str) -> bool {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
