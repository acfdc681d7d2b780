//! Service registry
//!
//! A [`Service`] binds one application object to a set of named methods.
//! Each method is registered with a typed handler and stored type-erased:
//! the server asks the method for an empty [`Argument`], lets the connection
//! codec decode the request body into it, and then invokes the handler to
//! get a [`Reply`] it can hand back to the codec.
//!
//! Only methods of the shape `Fn(&S, A) -> Result<R, E>` can be registered,
//! where `A` and `R` cross a codec (`A: DeserializeOwned`, `R: Serialize`)
//! and `E` can be rendered as text. The shape is checked by the compiler:
//!
//! ```compile_fail
//! use wirecall::Service;
//!
//! struct Opaque;
//! struct Arith;
//!
//! // `Opaque` cannot be serialized, so it can never be a reply.
//! let _ = Service::new(Arith).method("Leak", |_: &Arith, _: i32| Ok::<_, String>(Opaque));
//! ```
//!
//! Anything on `S` that is not registered stays private to the process.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::protocol::{DecodeTarget, Error, Result};

/// Reply produced by a method, ready to be encoded by any codec.
pub type Reply = Box<dyn erased_serde::Serialize + Send>;

type Handler = dyn Fn(Box<dyn Any + Send>) -> Result<Reply> + Send + Sync;

/// Storage a codec decodes into, and the handler later takes back out.
trait ArgumentSlot: Send {
    fn as_target(&mut self) -> &mut dyn DecodeTarget;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> ArgumentSlot for Option<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn as_target(&mut self) -> &mut dyn DecodeTarget {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Empty argument of a method's declared type.
pub struct Argument {
    slot: Box<dyn ArgumentSlot>,
}

impl Argument {
    /// Decode destination for the request body.
    pub fn target(&mut self) -> &mut dyn DecodeTarget {
        self.slot.as_target()
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argument").finish_non_exhaustive()
    }
}

/// One remotely invocable method.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    new_argument: fn() -> Argument,
    handler: Box<Handler>,
}

impl MethodType {
    /// Method name, without the service prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name of the argument.
    #[must_use]
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Rust type name of the reply.
    #[must_use]
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of times the method has been invoked.
    #[must_use]
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Fresh, empty argument for this method.
    #[must_use]
    pub fn new_argument(&self) -> Argument {
        (self.new_argument)()
    }

    /// Run the handler on a decoded argument.
    ///
    /// An error returned by the handler becomes [`Error::Remote`] carrying
    /// its text. So does a panic, so the caller still gets a response.
    pub fn invoke(&self, argument: Argument) -> Result<Reply> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        let slot = argument.slot.into_any();
        panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(slot))).unwrap_or_else(|payload| {
            let reason = panic_message(payload.as_ref());
            warn!(method = %self.name, %reason, "method panicked");
            Err(Error::Remote(format!("method {} panicked: {reason}", self.name)))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "unknown cause"
    }
}

impl fmt::Debug for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish_non_exhaustive()
    }
}

fn new_argument<A>() -> Argument
where
    A: DeserializeOwned + Send + 'static,
{
    Argument {
        slot: Box::new(None::<A>),
    }
}

/// A named object whose registered methods can be called remotely.
pub struct Service {
    name: String,
    type_name: &'static str,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Start a service named after the type of `instance`.
    ///
    /// The name is the last path segment of the type name with any generic
    /// arguments removed, so `app::Arith<u8>` becomes `Arith`.
    #[must_use]
    pub fn new<S>(instance: S) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        Self::with_name(service_name_of::<S>(), instance)
    }

    /// Start a service with an explicit name.
    #[must_use]
    pub fn with_name<S>(name: impl Into<String>, instance: S) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        ServiceBuilder {
            service: Service {
                name: name.into(),
                type_name: type_name::<S>(),
                methods: HashMap::new(),
            },
            instance: Arc::new(instance),
        }
    }

    /// Service name used in `Service.Method`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name of the bound instance.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Look up a registered method.
    #[must_use]
    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke `method` with a decoded argument.
    pub fn call(&self, method: &MethodType, argument: Argument) -> Result<Reply> {
        method.invoke(argument)
    }

    pub(crate) fn validate_name(&self) -> Result<()> {
        if is_identifier(&self.name) {
            Ok(())
        } else {
            Err(Error::InvalidServiceName(self.name.clone()))
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Collects the methods of a service before it is registered.
pub struct ServiceBuilder<S> {
    service: Service,
    instance: Arc<S>,
}

impl<S> ServiceBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// Expose `handler` as `name`.
    ///
    /// A name that is not a valid identifier, or that is already taken, is
    /// skipped with a log line.
    #[must_use]
    pub fn method<A, R, E, F>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display,
        F: Fn(&S, A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        if !is_identifier(name) {
            warn!(service = %self.service.name, method = name, "skipping method with invalid name");
            return self;
        }
        if self.service.methods.contains_key(name) {
            warn!(service = %self.service.name, method = name, "skipping duplicate method");
            return self;
        }

        let instance = Arc::clone(&self.instance);
        let erased = move |argument: Box<dyn Any + Send>| -> Result<Reply> {
            let slot = argument
                .downcast::<Option<A>>()
                .map_err(|_| Error::Decode(format!("argument is not a {}", type_name::<A>())))?;
            let argument = (*slot).ok_or_else(|| Error::Decode("argument was never decoded".into()))?;
            match handler(&*instance, argument) {
                Ok(reply) => Ok(Box::new(reply) as Reply),
                Err(err) => Err(Error::Remote(err.to_string())),
            }
        };

        debug!(
            service = %self.service.name,
            method = name,
            arg = type_name::<A>(),
            reply = type_name::<R>(),
            "method registered"
        );
        self.service.methods.insert(
            name.to_owned(),
            Arc::new(MethodType {
                name: name.to_owned(),
                arg_type: type_name::<A>(),
                reply_type: type_name::<R>(),
                num_calls: AtomicU64::new(0),
                new_argument: new_argument::<A>,
                handler: Box::new(erased),
            }),
        );
        self
    }

    /// Finish the service.
    #[must_use]
    pub fn build(self) -> Service {
        self.service
    }
}

impl<S> From<ServiceBuilder<S>> for Service
where
    S: Send + Sync + 'static,
{
    fn from(builder: ServiceBuilder<S>) -> Self {
        builder.build()
    }
}

fn service_name_of<S>() -> String {
    let full = type_name::<S>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_owned()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {
            chars.all(|c| c.is_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
