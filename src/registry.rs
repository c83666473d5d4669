//! The classified state registry.
//!
//! Pipeline components are registered under a key with a fixed ownership
//! classification: `Shared` components exist once for the whole engine and
//! are only reachable through synchronized accessors; `Isolated` components
//! are re-created from their factory once per worker and owned exclusively
//! by that worker. The registry replaces ambient global pipeline state with
//! capability-scoped lookup, so a worker cannot accidentally mutate another
//! worker's scratch state or reach a shared table without synchronization.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap;

/// How a registered component is owned across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// One instance for the whole engine, lazily constructed, synchronized.
    Shared,
    /// One instance per worker, constructed from the factory at worker start.
    Isolated,
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ownership::Shared => write!(f, "shared"),
            Ownership::Isolated => write!(f, "isolated"),
        }
    }
}

/// Registry misuse. These indicate a mis-wired engine configuration, not a
/// compilation failure, and are surfaced immediately to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateKey(&'static str),
    UnknownKey(&'static str),
    WrongOwnership {
        key: &'static str,
        expected: Ownership,
        found: Ownership,
    },
    TypeMismatch(&'static str),
    Frozen(&'static str),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryError::DuplicateKey(key) => {
                write!(f, "state component '{key}' is already registered")
            }
            RegistryError::UnknownKey(key) => {
                write!(f, "state component '{key}' was never registered")
            }
            RegistryError::WrongOwnership { key, expected, found } => {
                write!(f, "state component '{key}' is {found}, not {expected}")
            }
            RegistryError::TypeMismatch(key) => {
                write!(f, "state component '{key}' has a different type than requested")
            }
            RegistryError::Frozen(key) => {
                write!(
                    f,
                    "cannot register '{key}': the registry is frozen because workers have started"
                )
            }
        }
    }
}

impl std::error::Error for RegistryError {}

type Factory = dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync;

struct Entry {
    ownership: Ownership,
    factory: Box<Factory>,
    /// First-writer-wins slot for `Shared` entries. Concurrent callers block
    /// on the mutex until construction finishes and then observe the same
    /// instance; the factory never runs twice.
    slot: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// Key → component map classifying every piece of pipeline state.
///
/// Classification is fixed at registration. Once the first worker starts the
/// registry is frozen and further registration is rejected.
pub struct StateRegistry {
    entries: RwLock<AHashMap<&'static str, Arc<Entry>>>,
    frozen: AtomicBool,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(AHashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Register a component constructed once for the whole engine.
    pub fn register_shared<F>(&self, key: &'static str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Any + Send + Sync> + Send + Sync + 'static,
    {
        self.register(key, Ownership::Shared, Box::new(factory))
    }

    /// Register a component re-constructed from the factory per worker.
    pub fn register_isolated<F>(&self, key: &'static str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Any + Send + Sync> + Send + Sync + 'static,
    {
        self.register(key, Ownership::Isolated, Box::new(factory))
    }

    fn register(
        &self,
        key: &'static str,
        ownership: Ownership,
        factory: Box<Factory>,
    ) -> Result<(), RegistryError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(RegistryError::Frozen(key));
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        entries.insert(
            key,
            Arc::new(Entry {
                ownership,
                factory,
                slot: Mutex::new(None),
            }),
        );
        Ok(())
    }

    /// Reject further registration. Called when the first worker starts.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// The classification a key was registered with.
    pub fn ownership(&self, key: &'static str) -> Result<Ownership, RegistryError> {
        self.entry(key).map(|entry| entry.ownership)
    }

    /// The process-wide instance of a `Shared` component, constructing it on
    /// first access. Construction is first-writer-wins: callers racing on an
    /// unconstructed entry block until the factory finishes, then all observe
    /// the same instance.
    pub fn shared<T: Any + Send + Sync>(&self, key: &'static str) -> Result<Arc<T>, RegistryError> {
        let entry = self.expect(key, Ownership::Shared)?;
        let mut slot = entry.slot.lock().unwrap_or_else(|e| e.into_inner());
        let value = match slot.as_ref() {
            Some(value) => value.clone(),
            None => {
                let value: Arc<dyn Any + Send + Sync> = Arc::from((entry.factory)());
                *slot = Some(value.clone());
                value
            }
        };
        drop(slot);
        value.downcast::<T>().map_err(|_| RegistryError::TypeMismatch(key))
    }

    /// Replace the instance of a `Shared` component. Synchronized with
    /// concurrent `shared` accessors through the same entry lock.
    pub fn put_shared<T: Any + Send + Sync>(
        &self,
        key: &'static str,
        value: T,
    ) -> Result<(), RegistryError> {
        let entry = self.expect(key, Ownership::Shared)?;
        let mut slot = entry.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(value));
        Ok(())
    }

    /// Run every `Isolated` factory once, producing the private state bundle
    /// for one worker. Called exactly once per worker at worker start.
    pub fn build_isolated_set(&self) -> IsolatedSet {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let slots = entries
            .iter()
            .filter(|(_, entry)| entry.ownership == Ownership::Isolated)
            .map(|(key, entry)| (*key, (entry.factory)()))
            .collect();
        IsolatedSet { slots }
    }

    fn entry(&self, key: &'static str) -> Result<Arc<Entry>, RegistryError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned().ok_or(RegistryError::UnknownKey(key))
    }

    fn expect(&self, key: &'static str, expected: Ownership) -> Result<Arc<Entry>, RegistryError> {
        let entry = self.entry(key)?;
        if entry.ownership != expected {
            return Err(RegistryError::WrongOwnership {
                key,
                expected,
                found: entry.ownership,
            });
        }
        Ok(entry)
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker's private instances of every `Isolated` component. Owned and
/// mutated by a single worker, never observed by any other thread, so access
/// needs no synchronization.
pub struct IsolatedSet {
    slots: AHashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl IsolatedSet {
    pub fn get<T: Any>(&self, key: &'static str) -> Result<&T, RegistryError> {
        self.slots
            .get(key)
            .ok_or(RegistryError::UnknownKey(key))?
            .downcast_ref::<T>()
            .ok_or(RegistryError::TypeMismatch(key))
    }

    pub fn get_mut<T: Any>(&mut self, key: &'static str) -> Result<&mut T, RegistryError> {
        self.slots
            .get_mut(key)
            .ok_or(RegistryError::UnknownKey(key))?
            .downcast_mut::<T>()
            .ok_or(RegistryError::TypeMismatch(key))
    }

    /// Replace this worker's private instance. Affects only the calling
    /// worker's slot.
    pub fn put<T: Any + Send + Sync>(&mut self, key: &'static str, value: T) -> Result<(), RegistryError> {
        match self.slots.get_mut(key) {
            Some(slot) => {
                *slot = Box::new(value);
                Ok(())
            }
            None => Err(RegistryError::UnknownKey(key)),
        }
    }
}
