//! Method registry and invocation.
//!
//! Every operation the proxied target exposes is registered up front in
//! a [`MethodRegistry`], mapping the method name to a typed async
//! handler. Lookup failures are typed faults, not silent no-ops.
//!
//! The [`Invoker`] wraps each call with the mode's pre/post hooks and
//! converts every failure (lookup, hook, handler, result
//! serialization) into a [`RemoteError`] so nothing escapes the
//! invocation task.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::RemoteError;

/// Outcome of one method invocation, before it becomes a reply envelope.
pub type MethodResult = std::result::Result<Value, RemoteError>;

/// Boxed future for type-erased method handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Positional and named arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// Positional arguments, in call order.
    pub args: Vec<Value>,
    /// Named arguments.
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Build from raw envelope fields.
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Deserialize the positional argument at `index`.
    ///
    /// # Errors
    ///
    /// `bad_arguments` fault if the argument is missing or has the
    /// wrong shape.
    pub fn arg<A: DeserializeOwned>(&self, index: usize) -> std::result::Result<A, RemoteError> {
        let value = self.args.get(index).ok_or_else(|| {
            RemoteError::new("bad_arguments", format!("missing positional argument {index}"))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            RemoteError::new("bad_arguments", format!("argument {index}: {e}"))
        })
    }

    /// Deserialize the named argument `name`, if present.
    ///
    /// # Errors
    ///
    /// `bad_arguments` fault if the value has the wrong shape.
    pub fn kwarg<A: DeserializeOwned>(
        &self,
        name: &str,
    ) -> std::result::Result<Option<A>, RemoteError> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| RemoteError::new("bad_arguments", format!("kwarg {name}: {e}"))),
        }
    }
}

/// Trait for type-erased method handlers.
pub trait Method<T>: Send + Sync + 'static {
    /// Invoke the method against the target.
    fn call(&self, target: Arc<T>, args: CallArgs) -> BoxFuture<'static, MethodResult>;
}

/// Wrapper serializing a typed handler's return value into a [`Value`].
pub struct TypedMethod<F, T, Fut, R> {
    handler: F,
    _phantom: PhantomData<fn(Arc<T>) -> (Fut, R)>,
}

impl<F, T, Fut, R> TypedMethod<F, T, Fut, R>
where
    F: Fn(Arc<T>, CallArgs) -> Fut + Send + Sync + 'static,
    T: Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    /// Wrap a typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut, R> Method<T> for TypedMethod<F, T, Fut, R>
where
    F: Fn(Arc<T>, CallArgs) -> Fut + Send + Sync + 'static,
    T: Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn call(&self, target: Arc<T>, args: CallArgs) -> BoxFuture<'static, MethodResult> {
        let fut = (self.handler)(target, args);
        Box::pin(async move {
            let result = fut.await?;
            serde_json::to_value(result)
                .map_err(|e| RemoteError::new("serialize_error", e.to_string()))
        })
    }
}

/// Registry mapping method names to handlers for a target type.
pub struct MethodRegistry<T> {
    methods: HashMap<String, Box<dyn Method<T>>>,
}

impl<T: Send + Sync + 'static> MethodRegistry<T> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a method handler under `name`.
    ///
    /// The handler receives the shared target and the call arguments;
    /// its return value is serialized into the reply's `result`.
    pub fn register<F, Fut, R>(&mut self, name: &str, handler: F)
    where
        F: Fn(Arc<T>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, RemoteError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.methods
            .insert(name.to_string(), Box::new(TypedMethod::new(handler)));
    }

    /// Look up a handler by method name.
    pub fn get(&self, name: &str) -> Option<&dyn Method<T>> {
        self.methods.get(name).map(|m| m.as_ref())
    }

    /// Registered method names, for startup logging.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(|s| s.as_str())
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<T: Send + Sync + 'static> Default for MethodRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre/post hooks wrapping every invocation.
///
/// Modes simulate external conditions around the call (signal delivery,
/// restarts, ...). A hook failure becomes a fault reply like any other
/// invocation failure. `post` only runs after a successful call, so the
/// pair is not guaranteed when the call itself fails.
pub trait Mode<T>: Send + Sync + 'static {
    /// Runs before the method.
    fn pre(&self, _method_name: &str, _target: &T) -> std::result::Result<(), RemoteError> {
        Ok(())
    }

    /// Runs after a successful method call.
    fn post(&self, _method_name: &str, _target: &T) -> std::result::Result<(), RemoteError> {
        Ok(())
    }
}

/// Mode that leaves calls alone.
pub struct PassthroughMode;

impl<T: Send + Sync + 'static> Mode<T> for PassthroughMode {}

/// Resolves and runs one method call with its hooks.
pub struct Invoker<T> {
    target: Arc<T>,
    registry: Arc<MethodRegistry<T>>,
    mode: Arc<dyn Mode<T>>,
}

impl<T: Send + Sync + 'static> Clone for Invoker<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            registry: self.registry.clone(),
            mode: self.mode.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Invoker<T> {
    /// Create an invoker over a target, its registry, and a mode.
    pub fn new(target: Arc<T>, registry: MethodRegistry<T>, mode: Arc<dyn Mode<T>>) -> Self {
        Self {
            target,
            registry: Arc::new(registry),
            mode,
        }
    }

    /// Shared handle to the target.
    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    /// Invoke `method_name` with the given arguments.
    ///
    /// Order: lookup, `pre` hook, handler, `post` hook. Any failure
    /// short-circuits into a [`RemoteError`].
    pub async fn invoke(&self, method_name: &str, args: CallArgs) -> MethodResult {
        let method = self
            .registry
            .get(method_name)
            .ok_or_else(|| RemoteError::no_such_method(method_name))?;

        self.mode.pre(method_name, &self.target)?;
        let result = method.call(self.target.clone(), args).await?;
        self.mode.post(method_name, &self.target)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echoer;

    fn echo_registry() -> MethodRegistry<Echoer> {
        let mut registry = MethodRegistry::new();
        registry.register("echo", |_target: Arc<Echoer>, args: CallArgs| async move {
            args.arg::<String>(0)
        });
        registry
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let invoker = Invoker::new(Arc::new(Echoer), echo_registry(), Arc::new(PassthroughMode));
        let args = CallArgs::new(vec![json!("hi")], BTreeMap::new());
        assert_eq!(invoker.invoke("echo", args).await.unwrap(), json!("hi"));
    }

    #[tokio::test]
    async fn test_unknown_method_fails_fast() {
        let invoker = Invoker::new(Arc::new(Echoer), echo_registry(), Arc::new(PassthroughMode));
        let err = invoker.invoke("missing", CallArgs::default()).await.unwrap_err();
        assert_eq!(err.kind, "no_such_method");
    }

    #[tokio::test]
    async fn test_missing_argument_is_bad_arguments() {
        let invoker = Invoker::new(Arc::new(Echoer), echo_registry(), Arc::new(PassthroughMode));
        let err = invoker.invoke("echo", CallArgs::default()).await.unwrap_err();
        assert_eq!(err.kind, "bad_arguments");
    }

    #[tokio::test]
    async fn test_hooks_wrap_the_call() {
        struct CountingMode {
            pre: AtomicUsize,
            post: AtomicUsize,
        }
        impl Mode<Echoer> for Arc<CountingMode> {
            fn pre(&self, _m: &str, _t: &Echoer) -> std::result::Result<(), RemoteError> {
                self.pre.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn post(&self, _m: &str, _t: &Echoer) -> std::result::Result<(), RemoteError> {
                self.post.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let mode = Arc::new(CountingMode {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
        });
        let invoker = Invoker::new(Arc::new(Echoer), echo_registry(), Arc::new(mode.clone()));

        let args = CallArgs::new(vec![json!("x")], BTreeMap::new());
        invoker.invoke("echo", args).await.unwrap();
        assert_eq!(mode.pre.load(Ordering::SeqCst), 1);
        assert_eq!(mode.post.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_skipped_when_call_fails() {
        struct TrackingMode {
            post: AtomicUsize,
        }
        impl Mode<Echoer> for Arc<TrackingMode> {
            fn post(&self, _m: &str, _t: &Echoer) -> std::result::Result<(), RemoteError> {
                self.post.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let mut registry = echo_registry();
        registry.register("boom", |_t: Arc<Echoer>, _a: CallArgs| async move {
            Err::<Value, _>(RemoteError::new("DomainError", "nope"))
        });

        let mode = Arc::new(TrackingMode {
            post: AtomicUsize::new(0),
        });
        let invoker = Invoker::new(Arc::new(Echoer), registry, Arc::new(mode.clone()));

        let err = invoker.invoke("boom", CallArgs::default()).await.unwrap_err();
        assert_eq!(err.message, "nope");
        assert_eq!(mode.post.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pre_hook_failure_becomes_fault() {
        struct FailingMode;
        impl Mode<Echoer> for FailingMode {
            fn pre(&self, method: &str, _t: &Echoer) -> std::result::Result<(), RemoteError> {
                Err(RemoteError::new("mode_error", format!("pre failed for {method}")))
            }
        }

        let invoker = Invoker::new(Arc::new(Echoer), echo_registry(), Arc::new(FailingMode));
        let args = CallArgs::new(vec![json!("hi")], BTreeMap::new());
        let err = invoker.invoke("echo", args).await.unwrap_err();
        assert_eq!(err.kind, "mode_error");
    }

    #[test]
    fn test_registry_names() {
        let registry = echo_registry();
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["echo"]);
    }
}
