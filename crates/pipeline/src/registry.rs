//! Typed service lookup shared by all stages.
//!
//! Services are stored as `Arc<T>` keyed by type, so trait objects work as
//! keys too: register an `Arc<dyn HistoryStore>` and look it up with
//! `get::<dyn HistoryStore>()`. The registry is assembled once per engine
//! and read-only afterwards.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PipelineError;

#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    names: Vec<&'static str>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service`, replacing any earlier service of the same type.
    pub fn insert<T>(&mut self, service: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if self
            .services
            .insert(TypeId::of::<Arc<T>>(), Box::new(service))
            .is_none()
        {
            self.names.push(type_name::<T>());
        }
    }

    pub fn with<T>(mut self, service: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.insert(service);
        self
    }

    /// An optional collaborator.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services
            .get(&TypeId::of::<Arc<T>>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<T>>())
            .cloned()
    }

    /// A collaborator the caller cannot work without.
    pub fn require<T>(&self) -> Result<Arc<T>, PipelineError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get::<T>()
            .ok_or(PipelineError::MissingService(type_name::<T>()))
    }

    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services.contains_key(&TypeId::of::<Arc<T>>())
    }

    /// Type names of everything registered, in registration order.
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names)
            .finish()
    }
}
