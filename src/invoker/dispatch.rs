//! Method dispatch table of an exported service.
//!
//! A [`ServiceDispatcher`] maps method names to typed async closures. It is
//! built once when the service is exported; incoming invocations look up the
//! method by name and hand it the positional arguments.
//!
//! # Example
//!
//! ```ignore
//! use joywire::invoker::ServiceDispatcher;
//!
//! let echo = ServiceDispatcher::new("demo.Echo")
//!     .method("echo", |(text,): (String,)| async move { Ok(text) })
//!     .method("add", |(a, b): (i64, i64)| async move { Ok(a + b) });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, RpcError};
use crate::protocol::{Invocation, ResponsePayload};
use crate::transport::BoxFuture;

/// One callable method.
pub trait MethodHandler: Send + Sync + 'static {
    /// Invoke with positional arguments.
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value>>;
}

/// Wrapper that decodes arguments into `A` and encodes the result `R`.
pub struct TypedMethod<F, A, R, Fut>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(A) -> Fut>,
}

impl<F, A, R, Fut> TypedMethod<F, A, R, Fut>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

/// Decode positional arguments.
///
/// A single argument is first tried on its own, so a method taking one
/// non-tuple parameter can be called with one value.
fn decode_args<A: DeserializeOwned>(mut args: Vec<Value>) -> Result<A> {
    if args.len() == 1 {
        if let Ok(value) = serde_json::from_value(args[0].clone()) {
            return Ok(value);
        }
    }
    if args.is_empty() {
        if let Ok(value) = serde_json::from_value(Value::Null) {
            return Ok(value);
        }
    }
    let array = Value::Array(std::mem::take(&mut args));
    serde_json::from_value(array).map_err(|e| RpcError::Serializer(format!("bad arguments: {}", e)))
}

impl<F, A, R, Fut> MethodHandler for TypedMethod<F, A, R, Fut>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        let parsed: A = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(parsed);
        Box::pin(async move {
            let result = fut.await?;
            Ok(serde_json::to_value(result)?)
        })
    }
}

/// Method table of one service interface.
pub struct ServiceDispatcher {
    interface: String,
    methods: HashMap<String, Box<dyn MethodHandler>>,
}

impl ServiceDispatcher {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            methods: HashMap::new(),
        }
    }

    /// Register a method handler.
    ///
    /// `A` is decoded from the positional arguments: use a tuple for several
    /// parameters and `()` for none.
    pub fn method<F, A, R, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.methods
            .insert(name.to_string(), Box::new(TypedMethod::new(handler)));
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    /// Run `invocation` and wrap the outcome as a response payload.
    pub async fn dispatch(&self, invocation: Invocation) -> ResponsePayload {
        let Some(method) = self.methods.get(&invocation.method_name) else {
            return ResponsePayload::error(format!(
                "method {} not found in {}",
                invocation.method_name, self.interface
            ));
        };
        match method.call(invocation.args).await {
            Ok(value) => ResponsePayload::ok(value),
            Err(e) => {
                tracing::debug!(
                    "{}.{} failed: {}",
                    self.interface,
                    invocation.method_name,
                    e
                );
                ResponsePayload::error(e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for ServiceDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDispatcher")
            .field("interface", &self.interface)
            .field("methods", &self.method_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn calculator() -> ServiceDispatcher {
        ServiceDispatcher::new("demo.Calc")
            .method("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .method("neg", |n: i64| async move { Ok(-n) })
            .method("zero", |_: ()| async move { Ok(0) })
            .method("fail", |_: ()| async move {
                Err::<(), _>(RpcError::Invocation("boom".into()))
            })
    }

    fn call(method: &str, args: Vec<Value>) -> Invocation {
        Invocation::new("demo.Calc", "", method, args)
    }

    #[tokio::test]
    async fn test_dispatch_by_name() {
        let calc = calculator();
        assert!(calc.has_method("add"));
        assert_eq!(
            calc.dispatch(call("add", vec![json!(2), json!(3)])).await,
            ResponsePayload::ok(json!(5))
        );
        assert_eq!(
            calc.dispatch(call("neg", vec![json!(4)])).await,
            ResponsePayload::ok(json!(-4))
        );
        assert_eq!(
            calc.dispatch(call("zero", vec![])).await,
            ResponsePayload::ok(json!(0))
        );
    }

    #[tokio::test]
    async fn test_errors_become_exceptions() {
        let calc = calculator();
        assert!(calc.dispatch(call("missing", vec![])).await.is_error());
        assert!(calc.dispatch(call("add", vec![json!("x")])).await.is_error());
        let failed = calc.dispatch(call("fail", vec![])).await;
        assert!(failed.exception.unwrap().contains("boom"));
    }
}
