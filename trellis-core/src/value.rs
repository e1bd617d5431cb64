//! Observed objects and attribute values.
//!
//! The engine never inspects values. A [`Value`] is either an opaque JSON
//! payload or the [`Value::Uninitialized`] sentinel, which marks "this
//! attribute had no prior value". Observed objects are carried around as
//! [`ObjectHandle`]s; the engine only cares about their [`ObjectId`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Unique identity of an observed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Generate a new unique object ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An attribute value as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The attribute had no prior value.
    Uninitialized,
    /// Any concrete value.
    Data(serde_json::Value),
}

impl Value {
    /// Whether this is the uninitialized sentinel.
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, Value::Uninitialized)
    }

    /// Borrow the payload, if any.
    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Uninitialized => None,
            Value::Data(v) => Some(v),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.data().and_then(serde_json::Value::as_i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.data().and_then(serde_json::Value::as_str)
    }
}

macro_rules! impl_from_data {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Data(value.into())
                }
            }
        )*
    };
}

impl_from_data!(bool, i32, i64, u32, u64, f64, &str, String, serde_json::Value);

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uninitialized => f.write_str("<undefined>"),
            Value::Data(v) => write!(f, "{v}"),
        }
    }
}

/// A cheap, clonable handle to an observed object.
///
/// The handle keeps the object alive. Listener registrations never hold one,
/// only the caller of `notify` and the listeners' projected arguments do.
#[derive(Clone)]
pub struct ObjectHandle {
    id: ObjectId,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ObjectHandle {
    /// Wrap a new object, assigning it a fresh identity.
    pub fn new<T>(object: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self::from_arc(Arc::new(object))
    }

    /// Wrap an object that is already shared.
    pub fn from_arc<T>(object: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            id: ObjectId::new(),
            inner: object,
        }
    }

    /// Get the object's identity.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Borrow the object as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectHandle {}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle").field("id", &self.id).finish()
    }
}

/// The canonical change event: (object, attribute name, old value, new value).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub object: ObjectHandle,
    pub name: Arc<str>,
    pub old: Value,
    pub new: Value,
}

impl ChangeEvent {
    pub fn new(object: &ObjectHandle, name: impl Into<Arc<str>>, old: Value, new: Value) -> Self {
        Self {
            object: object.clone(),
            name: name.into(),
            old,
            new,
        }
    }
}
