//! Listener callbacks.
//!
//! A [`Callback`] is either a free function, held strongly, or a method bound
//! weakly to a receiver. A method callback keeps only a [`Weak`] to its
//! receiver plus the method name, so registering it never keeps the receiver
//! alive. The receiver is not counted in a method's arity.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use super::projector::{Arg, Args};
use crate::error::BoxError;

/// What a listener returns. An `Err` is routed through the exception
/// handler stack.
pub type ListenerResult = std::result::Result<(), BoxError>;

type FunctionBody = dyn Fn(&Args) -> ListenerResult + Send + Sync;
type MethodBody = dyn Fn(&(dyn Any + Send + Sync), &Args) -> ListenerResult + Send + Sync;

/// A listener callback together with its declared arity.
#[derive(Clone)]
pub enum Callback {
    Function {
        name: Arc<str>,
        arity: usize,
        body: Arc<FunctionBody>,
    },
    Method {
        name: Arc<str>,
        arity: usize,
        receiver: Weak<dyn Any + Send + Sync>,
        body: Arc<MethodBody>,
    },
}

impl Callback {
    /// A function receiving its projected arguments as a slice.
    ///
    /// `arity` may be anything; values above 4 are rejected when the
    /// callback is registered.
    pub fn function<F>(name: impl Into<Arc<str>>, arity: usize, f: F) -> Self
    where
        F: Fn(&Args) -> ListenerResult + Send + Sync + 'static,
    {
        Callback::Function {
            name: name.into(),
            arity,
            body: Arc::new(f),
        }
    }

    pub fn arity0<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn() -> ListenerResult + Send + Sync + 'static,
    {
        Self::function(name, 0, move |_| f())
    }

    pub fn arity1<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&Arg) -> ListenerResult + Send + Sync + 'static,
    {
        Self::function(name, 1, move |args| f(&args[0]))
    }

    pub fn arity2<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&Arg, &Arg) -> ListenerResult + Send + Sync + 'static,
    {
        Self::function(name, 2, move |args| f(&args[0], &args[1]))
    }

    pub fn arity3<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&Arg, &Arg, &Arg) -> ListenerResult + Send + Sync + 'static,
    {
        Self::function(name, 3, move |args| f(&args[0], &args[1], &args[2]))
    }

    pub fn arity4<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&Arg, &Arg, &Arg, &Arg) -> ListenerResult + Send + Sync + 'static,
    {
        Self::function(name, 4, move |args| f(&args[0], &args[1], &args[2], &args[3]))
    }

    /// A method named `name` bound weakly to `receiver`.
    pub fn method<R, F>(receiver: &Arc<R>, name: impl Into<Arc<str>>, arity: usize, f: F) -> Self
    where
        R: Any + Send + Sync,
        F: Fn(&R, &Args) -> ListenerResult + Send + Sync + 'static,
    {
        let weak: Weak<R> = Arc::downgrade(receiver);
        let receiver: Weak<dyn Any + Send + Sync> = weak;
        Callback::Method {
            name: name.into(),
            arity,
            receiver,
            body: Arc::new(move |any: &(dyn Any + Send + Sync), args: &Args| match any.downcast_ref::<R>() {
                Some(r) => f(r, args),
                None => Err("method receiver has an unexpected type".into()),
            }),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        match self {
            Callback::Function { name, .. } | Callback::Method { name, .. } => name,
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Callback::Function { arity, .. } | Callback::Method { arity, .. } => *arity,
        }
    }

    /// Weak handle to the receiver, for method callbacks.
    pub fn receiver(&self) -> Option<&Weak<dyn Any + Send + Sync>> {
        match self {
            Callback::Function { .. } => None,
            Callback::Method { receiver, .. } => Some(receiver),
        }
    }

    /// Resolve the callback into something runnable.
    ///
    /// Returns `None` for a method whose receiver is gone. The returned
    /// [`Bound`] holds the receiver strongly only for the duration of one
    /// delivery.
    pub fn bind(&self) -> Option<Bound> {
        match self {
            Callback::Function { body, .. } => Some(Bound::Function(Arc::clone(body))),
            Callback::Method { receiver, body, .. } => receiver
                .upgrade()
                .map(|r| Bound::Method(r, Arc::clone(body))),
        }
    }

    /// Whether `self` and `other` denote the same listener.
    ///
    /// Methods match on name and live receiver; functions match on the
    /// identity of their body.
    pub fn same_listener(&self, other: &Callback) -> bool {
        match (self, other) {
            (Callback::Function { body: a, .. }, Callback::Function { body: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (
                Callback::Method { name: na, receiver: ra, .. },
                Callback::Method { name: nb, receiver: rb, .. },
            ) => {
                // Never upgrade here: the upgraded Arc could end up as the
                // receiver's last strong reference while a set lock is held.
                na == nb && ra.strong_count() > 0 && Weak::ptr_eq(ra, rb)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Function { name, arity, .. } => f
                .debug_struct("Function")
                .field("name", name)
                .field("arity", arity)
                .finish(),
            Callback::Method { name, arity, receiver, .. } => f
                .debug_struct("Method")
                .field("name", name)
                .field("arity", arity)
                .field("receiver_alive", &(receiver.strong_count() > 0))
                .finish(),
        }
    }
}

/// A callback resolved for one delivery.
#[derive(Clone)]
pub enum Bound {
    Function(Arc<FunctionBody>),
    Method(Arc<dyn Any + Send + Sync>, Arc<MethodBody>),
}

impl Bound {
    pub fn call(&self, args: &Args) -> ListenerResult {
        match self {
            Bound::Function(body) => body(args),
            Bound::Method(receiver, body) => body(receiver.as_ref(), args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use smallvec::smallvec;

    struct Counter;

    #[test]
    fn typed_constructors_record_arity() {
        assert_eq!(Callback::arity0("f", || Ok(())).arity(), 0);
        assert_eq!(Callback::arity1("f", |_| Ok(())).arity(), 1);
        assert_eq!(Callback::arity4("f", |_, _, _, _| Ok(())).arity(), 4);
        assert_eq!(Callback::function("f", 5, |_| Ok(())).arity(), 5);
    }

    #[test]
    fn method_arity_excludes_receiver() {
        let receiver = Arc::new(Counter);
        let cb = Callback::method(&receiver, "on_change", 1, |_: &Counter, _| Ok(()));
        assert_eq!(cb.arity(), 1);
        assert!(cb.receiver().is_some());
    }

    #[test]
    fn method_does_not_keep_receiver_alive() {
        let receiver = Arc::new(Counter);
        let cb = Callback::method(&receiver, "on_change", 0, |_: &Counter, _| Ok(()));
        assert!(cb.bind().is_some());
        drop(receiver);
        assert!(cb.bind().is_none());
    }

    #[test]
    fn bound_function_receives_args() {
        let cb = Callback::arity1("f", |a| match a.as_value().and_then(Value::as_i64) {
            Some(5) => Ok(()),
            other => Err(format!("unexpected {other:?}").into()),
        });
        let args: Args = smallvec![Arg::Value(Value::from(5))];
        assert!(cb.bind().unwrap().call(&args).is_ok());
    }

    #[test]
    fn function_identity_matching() {
        let a = Callback::arity0("a", || Ok(()));
        let a2 = a.clone();
        let b = Callback::arity0("a", || Ok(()));
        assert!(a.same_listener(&a2));
        assert!(!a.same_listener(&b));
    }

    #[test]
    fn method_matching_uses_name_and_receiver() {
        let r1 = Arc::new(Counter);
        let r2 = Arc::new(Counter);
        let m = |r: &Arc<Counter>, name: &str| Callback::method(r, name, 0, |_: &Counter, _| Ok(()));

        assert!(m(&r1, "on_x").same_listener(&m(&r1, "on_x")));
        assert!(!m(&r1, "on_x").same_listener(&m(&r1, "on_y")));
        assert!(!m(&r1, "on_x").same_listener(&m(&r2, "on_x")));
        assert!(!m(&r1, "on_x").same_listener(&Callback::arity0("on_x", || Ok(()))));
    }

    #[test]
    fn matching_never_holds_the_receiver() {
        let receiver = Arc::new(Counter);
        let a = Callback::method(&receiver, "on_x", 0, |_: &Counter, _| Ok(()));
        let b = Callback::method(&receiver, "on_x", 0, |_: &Counter, _| Ok(()));
        assert!(a.same_listener(&b));
        assert_eq!(Arc::strong_count(&receiver), 1);

        drop(receiver);
        assert!(!a.same_listener(&b));
    }
}
