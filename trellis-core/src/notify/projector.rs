//! Argument Projection
//!
//! Every change is described by the same canonical 4-tuple
//! (object, name, old, new). Listeners declare how many positional
//! arguments they want (0 to 4) and receive a projection of that tuple.
//! Which fields are kept depends on the kind of listener:
//!
//! | arity | per-attribute      | any-attribute      | static per-attribute |
//! |-------|--------------------|--------------------|----------------------|
//! | 0     | ()                 | ()                 | ()                   |
//! | 1     | (new)              | (object)           | (object)             |
//! | 2     | (name, new)        | (object, name)     | (object, new)        |
//! | 3     | (object, name, new)| (object, name, new)| (object, old, new)   |
//! | 4     | (object, name, old, new) for every kind                        |

use std::sync::Arc;

use smallvec::SmallVec;

use crate::value::{ChangeEvent, ObjectHandle, Value};

/// Largest arity a listener may declare.
pub const MAX_ARITY: usize = 4;

/// One projected positional argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Object(ObjectHandle),
    Name(Arc<str>),
    Value(Value),
}

impl Arg {
    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Arg::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Arg::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Projected arguments. Never more than [`MAX_ARITY`] entries.
pub type Args = SmallVec<[Arg; MAX_ARITY]>;

/// Which projection table a listener uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Listener on one named attribute.
    PerAttribute,
    /// Listener on every attribute of an object.
    AnyAttribute,
    /// Listener declared statically for one named attribute.
    StaticAttribute,
}

impl Projection {
    /// Label used in signature errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Projection::PerAttribute => "dynamic trait",
            Projection::AnyAttribute => "dynamic anytrait",
            Projection::StaticAttribute => "static trait",
        }
    }

    /// Project `event` down to `arity` positional arguments.
    ///
    /// `arity` is validated at registration, so anything above
    /// [`MAX_ARITY`] is treated as [`MAX_ARITY`].
    pub fn project(&self, event: &ChangeEvent, arity: usize) -> Args {
        let object = || Arg::Object(event.object.clone());
        let name = || Arg::Name(event.name.clone());
        let old = || Arg::Value(event.old.clone());
        let new = || Arg::Value(event.new.clone());

        let mut args = Args::new();
        match (self, arity.min(MAX_ARITY)) {
            (_, 0) => {}
            (Projection::PerAttribute, 1) => args.push(new()),
            (Projection::PerAttribute, 2) => args.extend([name(), new()]),
            (Projection::AnyAttribute, 1) | (Projection::StaticAttribute, 1) => args.push(object()),
            (Projection::AnyAttribute, 2) => args.extend([object(), name()]),
            (Projection::StaticAttribute, 2) => args.extend([object(), new()]),
            (Projection::StaticAttribute, 3) => args.extend([object(), old(), new()]),
            (_, 3) => args.extend([object(), name(), new()]),
            _ => args.extend([object(), name(), old(), new()]),
        }
        args
    }
}
