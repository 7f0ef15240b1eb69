//! Ownership of large buffers shared between steps.
//!
//! A step cache holds its buffers as [`Owned`]. Downstream steps receive
//! [`View`]s, read-only aliases that never release the buffer on their own
//! behalf. [`Shared`] is either of the two, for caches that sometimes pass an
//! upstream buffer through unchanged. [`Deferred`] holds a derived value that
//! is built on first access.

use anyhow::{anyhow, Result};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

/// A buffer owned by exactly one step cache.
pub struct Owned<T>(Arc<T>);

impl<T> Owned<T> {
    /// Take ownership of `value`.
    pub fn new(value: T) -> Self {
        Owned(Arc::new(value))
    }

    /// A read-only alias of this buffer.
    pub fn view(&self) -> View<T> {
        View(Arc::clone(&self.0))
    }

    /// True if both handles refer to the same allocation.
    pub fn same_buffer(&self, other: &Owned<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// True if `view` aliases this buffer.
    pub fn is_viewed_by(&self, view: &View<T>) -> bool {
        Arc::ptr_eq(&self.0, &view.0)
    }
}

impl<T> Deref for Owned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&*self.0).finish()
    }
}

/// A non-owning, read-only alias of an [`Owned`] buffer.
pub struct View<T>(Arc<T>);

impl<T> View<T> {
    /// True if both views alias the same allocation.
    pub fn same_buffer(&self, other: &View<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the aliased buffer, for identity checks.
    pub fn as_ptr(&self) -> *const T {
        Arc::as_ptr(&self.0)
    }
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        View(Arc::clone(&self.0))
    }
}

impl<T> Deref for View<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for View<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("View").field(&*self.0).finish()
    }
}

/// A cache entry that either owns its buffer or passes an upstream one through.
#[derive(Debug)]
pub enum Shared<T> {
    /// A fresh allocation owned by this cache.
    Owned(Owned<T>),
    /// An alias of another step's buffer.
    View(View<T>),
}

impl<T> Shared<T> {
    /// A view of the underlying buffer, whoever owns it.
    pub fn view(&self) -> View<T> {
        match self {
            Shared::Owned(owned) => owned.view(),
            Shared::View(view) => view.clone(),
        }
    }

    /// True if this entry aliases another step's buffer.
    pub fn is_view(&self) -> bool {
        matches!(self, Shared::View(_))
    }

    /// The owned buffer, if this entry owns one.
    pub fn as_owned(&self) -> Option<&Owned<T>> {
        match self {
            Shared::Owned(owned) => Some(owned),
            Shared::View(_) => None,
        }
    }

    /// Address of the underlying buffer, for identity checks.
    pub fn as_ptr(&self) -> *const T {
        match self {
            Shared::Owned(owned) => Arc::as_ptr(&owned.0),
            Shared::View(view) => view.as_ptr(),
        }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self {
            Shared::Owned(owned) => owned,
            Shared::View(view) => view,
        }
    }
}

type Init<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

struct LazyCell<T> {
    cell: OnceLock<T>,
    init: Option<Init<T>>,
}

/// A derived value computed on first access and cached afterwards.
///
/// Clones share the same cell, so a downstream step holding a clone sees the
/// value built by whichever side forced it first.
pub struct Deferred<T>(Arc<LazyCell<T>>);

impl<T> Deferred<T> {
    /// A value that is built by `init` when first requested.
    pub fn new(init: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        Deferred(Arc::new(LazyCell {
            cell: OnceLock::new(),
            init: Some(Box::new(init)),
        }))
    }

    /// An already built value.
    pub fn ready(value: T) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(value);
        Deferred(Arc::new(LazyCell { cell, init: None }))
    }

    /// True once the value has been built.
    pub fn is_ready(&self) -> bool {
        self.0.cell.get().is_some()
    }

    /// Get the value, building it if necessary. A failed build is not cached.
    pub fn get(&self) -> Result<&T> {
        if let Some(value) = self.0.cell.get() {
            return Ok(value);
        }
        let init = self
            .0
            .init
            .as_ref()
            .ok_or_else(|| anyhow!("deferred value has no initializer"))?;
        let value = init()?;
        // a concurrent caller may have won the race; either value is equivalent
        let _ = self.0.cell.set(value);
        self.0
            .cell
            .get()
            .ok_or_else(|| anyhow!("deferred value was not stored"))
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("ready", &self.is_ready())
            .finish()
    }
}
