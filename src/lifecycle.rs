//! Ownership of pooled network resources
//!
//! A `ResourceManager` hands out scoped handles to pooled resources and tears
//! the pool down exactly once through `release_all`, whether a run finished or
//! was cancelled. Dropping the manager releases it as well. The
//! `ResourceRegistry` remembers every manager so the process can sweep
//! whatever is still alive at shutdown.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Errors from acquiring a pooled resource
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The manager was released; no new resources are handed out
    #[error("Resource pool '{0}' has been released")]
    Released(String),

    /// Creating a new resource failed
    #[error("Failed to create resource: {0}")]
    Create(String),
}

/// Something that can tear down everything it owns
pub trait Release: Send + Sync {
    /// Releases owned resources; returns `true` only for the call that did the work
    fn release_all(&self) -> bool;

    /// Name used in logs
    fn name(&self) -> &str;
}

type Factory<R> = Box<dyn Fn(u64) -> Result<R, LifecycleError> + Send + Sync>;

struct PoolState<R> {
    idle: Vec<(u64, R)>,
    live: usize,
}

/// Pool of lazily created resources with a hard upper bound
pub struct ResourceManager<R> {
    name: String,
    factory: Factory<R>,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState<R>>,
    released: AtomicBool,
    next_id: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<R: Send + 'static> ResourceManager<R> {
    /// Creates a pool of at most `pool_size` resources built by `factory`
    ///
    /// The factory receives a sequential id for each resource it creates.
    pub fn new<F>(name: impl Into<String>, pool_size: usize, factory: F) -> Arc<Self>
    where
        F: Fn(u64) -> Result<R, LifecycleError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            factory: Box::new(factory),
            slots: Arc::new(Semaphore::new(pool_size.max(1))),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                live: 0,
            }),
            released: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState<R>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Borrows a resource, reusing an idle one or creating a new one
    ///
    /// Waits while every slot is in use.
    pub async fn acquire(self: &Arc<Self>) -> Result<ScopedHandle<R>, LifecycleError> {
        if self.is_released() {
            return Err(LifecycleError::Released(self.name.clone()));
        }
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| LifecycleError::Released(self.name.clone()))?;

        let reused = self.state().idle.pop();
        let (id, resource) = match reused {
            Some(entry) => entry,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let resource = (self.factory)(id)?;
                self.created.fetch_add(1, Ordering::Relaxed);
                self.state().live += 1;
                debug!(pool = %self.name, id, "created pooled resource");
                (id, resource)
            }
        };

        Ok(ScopedHandle {
            manager: Arc::clone(self),
            entry: Some((id, resource)),
            suspect: false,
            _permit: permit,
        })
    }

    fn give_back(&self, id: u64, resource: R, suspect: bool) {
        let mut state = self.state();
        if suspect || self.is_released() {
            state.live = state.live.saturating_sub(1);
            drop(state);
            if suspect {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.name, id, "discarded suspect resource");
            }
            drop(resource);
        } else {
            state.idle.push((id, resource));
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Resources currently alive, idle or borrowed
    pub fn live(&self) -> usize {
        self.state().live
    }

    /// Resources waiting in the pool for reuse
    pub fn idle(&self) -> usize {
        self.state().idle.len()
    }

    /// Total resources ever created by this manager
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Resources dropped because they were marked suspect
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl<R: Send + 'static> Release for ResourceManager<R> {
    fn release_all(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.slots.close();

        let idle = {
            let mut state = self.state();
            let idle = std::mem::take(&mut state.idle);
            state.live = state.live.saturating_sub(idle.len());
            idle
        };
        let dropped = idle.len();
        drop(idle);

        info!(pool = %self.name, dropped, borrowed = self.live(), "released resource pool");
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<R> Drop for ResourceManager<R> {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.slots.close();
            debug!(pool = %self.name, "resource pool dropped without explicit release");
        }
    }
}

/// A borrowed resource that goes back to its pool when dropped
///
/// Call `discard` after a failed operation so the resource is dropped
/// instead of being reused.
pub struct ScopedHandle<R: Send + 'static> {
    manager: Arc<ResourceManager<R>>,
    entry: Option<(u64, R)>,
    suspect: bool,
    _permit: OwnedSemaphorePermit,
}

impl<R: Send + 'static> ScopedHandle<R> {
    /// Id assigned to the underlying resource
    pub fn id(&self) -> u64 {
        self.entry.as_ref().map_or(0, |(id, _)| *id)
    }

    /// Marks the resource as suspect; it will not return to the pool
    pub fn discard(&mut self) {
        self.suspect = true;
    }
}

impl<R: Send + 'static> Deref for ScopedHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        match self.entry {
            Some((_, ref resource)) => resource,
            None => unreachable!("handle resource is only taken on drop"),
        }
    }
}

impl<R: Send + 'static> DerefMut for ScopedHandle<R> {
    fn deref_mut(&mut self) -> &mut R {
        match self.entry {
            Some((_, ref mut resource)) => resource,
            None => unreachable!("handle resource is only taken on drop"),
        }
    }
}

impl<R: Send + 'static> Drop for ScopedHandle<R> {
    fn drop(&mut self) {
        if let Some((id, resource)) = self.entry.take() {
            self.manager.give_back(id, resource, self.suspect);
        }
    }
}

/// Weak registry of every resource manager created by the process
#[derive(Default)]
pub struct ResourceRegistry {
    entries: Mutex<Vec<Weak<dyn Release>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Weak<dyn Release>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tracks a manager without keeping it alive
    pub fn register<T: Release + 'static>(&self, manager: &Arc<T>) {
        let manager: Arc<dyn Release> = manager.clone();
        let mut entries = self.entries();
        entries.retain(|entry| entry.strong_count() > 0);
        entries.push(Arc::downgrade(&manager));
    }

    /// Managers that are still alive
    pub fn live_count(&self) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Releases every manager still alive; returns how many needed releasing
    pub fn sweep(&self) -> usize {
        let entries = std::mem::take(&mut *self.entries());
        let mut swept = 0;
        for manager in entries.iter().filter_map(Weak::upgrade) {
            if manager.release_all() {
                info!(pool = manager.name(), "released leftover resource pool at shutdown");
                swept += 1;
            }
        }
        swept
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("live", &self.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Resource that counts how many instances are alive
    struct Tracked {
        alive: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn tracked_manager(pool_size: usize) -> (Arc<ResourceManager<Tracked>>, Arc<AtomicUsize>) {
        let alive = Arc::new(AtomicUsize::new(0));
        let counter = alive.clone();
        let manager = ResourceManager::new("test", pool_size, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Tracked {
                alive: counter.clone(),
            })
        });
        (manager, alive)
    }

    #[tokio::test]
    async fn test_resources_are_created_lazily_and_reused() {
        let (manager, alive) = tracked_manager(4);
        assert_eq!(manager.created(), 0);

        let first_id = {
            let handle = manager.acquire().await.unwrap();
            handle.id()
        };
        let second_id = manager.acquire().await.unwrap().id();

        assert_eq!(first_id, second_id, "Idle resource should be reused");
        assert_eq!(manager.created(), 1);
        assert_eq!(alive.load(Ordering::SeqCst), 1);
        assert_eq!(manager.idle(), 1);
    }

    #[tokio::test]
    async fn test_discarded_resource_is_recreated() {
        let (manager, alive) = tracked_manager(4);

        let first_id = {
            let mut handle = manager.acquire().await.unwrap();
            handle.discard();
            handle.id()
        };
        assert_eq!(alive.load(Ordering::SeqCst), 0, "Suspect resource should be dropped");
        assert_eq!(manager.discarded(), 1);

        let second_id = manager.acquire().await.unwrap().id();
        assert_ne!(first_id, second_id);
        assert_eq!(manager.created(), 2);
    }

    #[tokio::test]
    async fn test_pool_size_bounds_live_resources() {
        let (manager, _alive) = tracked_manager(2);

        let a = manager.acquire().await.unwrap();
        let _b = manager.acquire().await.unwrap();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            manager.acquire(),
        )
        .await;
        assert!(pending.is_err(), "Third acquire should wait for a free slot");

        drop(a);
        assert!(manager.acquire().await.is_ok());
        assert_eq!(manager.created(), 2);
    }

    #[tokio::test]
    async fn test_release_all_is_idempotent() {
        let (manager, alive) = tracked_manager(4);
        drop(manager.acquire().await.unwrap());
        assert_eq!(alive.load(Ordering::SeqCst), 1);

        assert!(manager.release_all());
        assert!(!manager.release_all(), "Second release should do nothing");
        assert_eq!(alive.load(Ordering::SeqCst), 0);
        assert_eq!(manager.live(), 0);
    }

    #[tokio::test]
    async fn test_acquire_after_release_fails() {
        let (manager, _alive) = tracked_manager(4);
        manager.release_all();

        let result = manager.acquire().await;
        assert!(matches!(result, Err(LifecycleError::Released(_))));
    }

    #[tokio::test]
    async fn test_borrowed_resource_dropped_after_release() {
        let (manager, alive) = tracked_manager(4);
        let handle = manager.acquire().await.unwrap();

        manager.release_all();
        assert_eq!(alive.load(Ordering::SeqCst), 1, "Borrowed resource unwinds first");

        drop(handle);
        assert_eq!(alive.load(Ordering::SeqCst), 0);
        assert_eq!(manager.idle(), 0);
    }

    #[tokio::test]
    async fn test_factory_error_frees_its_slot() {
        let alive = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let (counter, tries) = (alive.clone(), attempts.clone());
        let manager = ResourceManager::new("flaky", 1, move |_| {
            if tries.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(LifecycleError::Create("no sockets".to_string()));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Tracked {
                alive: counter.clone(),
            })
        });

        let result = manager.acquire().await;
        assert_eq!(
            result.err(),
            Some(LifecycleError::Create("no sockets".to_string()))
        );

        // The only slot must be free again, otherwise this waits forever
        let handle = tokio::time::timeout(std::time::Duration::from_secs(1), manager.acquire())
            .await
            .expect("Failed creation must free its slot")
            .expect("Second creation should succeed");
        assert_eq!(manager.live(), 1);
        assert_eq!(alive.load(Ordering::SeqCst), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        drop(handle);
    }

    #[tokio::test]
    async fn test_registry_sweeps_live_managers_once() {
        let registry = ResourceRegistry::new();
        let (kept, alive) = tracked_manager(2);
        let (already_released, _) = tracked_manager(2);
        drop(kept.acquire().await.unwrap());
        already_released.release_all();

        registry.register(&kept);
        registry.register(&already_released);
        {
            let (dropped, _) = tracked_manager(2);
            registry.register(&dropped);
        }
        assert_eq!(registry.live_count(), 2);

        assert_eq!(registry.sweep(), 1);
        assert_eq!(alive.load(Ordering::SeqCst), 0);
        assert!(kept.is_released());
        assert_eq!(registry.sweep(), 0);
    }
}
