//! Resolution scopes
//!
//! A [`Scope`] is an isolated context from which dependencies are
//! constructed and later released together. The pool acquires one scope for
//! its own lifetime (the broker client is resolved from it) and every
//! dispatched job gets a fresh scope of its own, so per-job state can never
//! leak between concurrent jobs.
//!
//! Constructors are registered on a [`ScopeFactory`] keyed by type. Within
//! one scope a type is constructed at most once and the instance is cached;
//! a different scope gets its own instance. `release()` drops everything the
//! scope constructed and is also run on drop, which covers early returns,
//! handler failures and panics alike.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;
use uuid::Uuid;

type Constructor = Arc<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Errors from scope resolution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    /// No constructor was registered for the requested type
    #[error("no constructor provided for {0}")]
    NotProvided(&'static str),

    /// The scope has been released and refuses further resolution
    #[error("scope has already been released")]
    Released,
}

/// Registry of per-scope constructors
///
/// # Example
///
/// ```ignore
/// let mut scopes = ScopeFactory::new();
/// scopes.provide(|| OrderService::connect());
/// scopes.provide_shared::<dyn JobBroker>(broker);
///
/// let scope = scopes.create_scope();
/// let service = scope.resolve::<OrderService>()?;
/// ```
#[derive(Default)]
pub struct ScopeFactory {
    constructors: HashMap<TypeId, Constructor>,
}

impl ScopeFactory {
    /// Create a new empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor invoked once per scope for `T`
    pub fn provide<T, F>(&mut self, constructor: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.constructors.insert(
            TypeId::of::<T>(),
            Arc::new(move || Box::new(Arc::new(constructor())) as Box<dyn Any + Send + Sync>),
        );
    }

    /// Register a shared instance resolved as-is in every scope
    ///
    /// Useful for process-wide collaborators (the broker client) and for
    /// trait objects, which cannot go through [`provide`](Self::provide).
    pub fn provide_shared<T>(&mut self, instance: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.constructors.insert(
            TypeId::of::<T>(),
            Arc::new(move || Box::new(Arc::clone(&instance)) as Box<dyn Any + Send + Sync>),
        );
    }

    /// Check if a constructor is registered for `T`
    pub fn provides<T: ?Sized + 'static>(&self) -> bool {
        self.constructors.contains_key(&TypeId::of::<T>())
    }

    /// Create a fresh scope
    pub fn create_scope(&self) -> Scope {
        Scope {
            id: Uuid::now_v7(),
            constructors: self.constructors.clone(),
            instances: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
        }
    }
}

/// One isolated resolution context
///
/// Exclusively owned by whoever created it: the pool for its lifetime
/// scope, a single in-flight dispatch for a job scope.
pub struct Scope {
    id: Uuid,
    constructors: HashMap<TypeId, Constructor>,
    instances: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    released: AtomicBool,
}

impl Scope {
    /// Unique identifier of this scope
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolve an instance of `T` from this scope
    ///
    /// The first resolution of a type runs its constructor; later
    /// resolutions within the same scope return the cached instance.
    ///
    /// # Errors
    ///
    /// Fails if no constructor was registered for `T` or if the scope has
    /// already been released.
    pub fn resolve<T>(&self) -> Result<Arc<T>, ScopeError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if self.released.load(Ordering::Acquire) {
            return Err(ScopeError::Released);
        }

        let key = TypeId::of::<T>();
        let mut instances = self.instances.lock().unwrap();

        if let Some(existing) = instances.get(&key) {
            if let Some(arc) = existing.downcast_ref::<Arc<T>>() {
                return Ok(Arc::clone(arc));
            }
        }

        let constructor = self
            .constructors
            .get(&key)
            .ok_or(ScopeError::NotProvided(std::any::type_name::<T>()))?;

        // A constructor registered under TypeId::of::<T>() always yields
        // a boxed Arc<T>.
        let arc = match constructor().downcast::<Arc<T>>() {
            Ok(arc) => *arc,
            Err(_) => return Err(ScopeError::NotProvided(std::any::type_name::<T>())),
        };

        instances.insert(key, Box::new(Arc::clone(&arc)));
        trace!(scope_id = %self.id, type_name = std::any::type_name::<T>(), "constructed scoped instance");
        Ok(arc)
    }

    /// Release everything this scope constructed
    ///
    /// Idempotent; a released scope refuses further resolution. Also run on
    /// drop, so every exit path of a dispatch tears the scope down.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.instances.lock().unwrap().clear();
        trace!(scope_id = %self.id, "scope released");
    }

    /// Check if this scope has been released
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}
