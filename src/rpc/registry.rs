//! Service registration and method dispatch.
//!
//! A service implements [`Service`] and declares its callable methods on a
//! [`MethodSet`]. Each method has the synchronous shape
//! `fn(&self, Args) -> Result<Reply, RpcError>`; the registry erases the
//! argument and reply types behind JSON so every codec can dispatch through
//! the same table.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CallError, RegistrationError};
use crate::rpc::protocol::RpcError;

/// Introspection record for one registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Method name → signature, e.g. `Sum` → `fn(Args) -> i64`
    pub methods: BTreeMap<String, String>,
}

/// A value exposing RPC methods.
pub trait Service: Send + Sync + Sized + 'static {
    /// Name the service registers under unless overridden.
    fn name(&self) -> String {
        short_type_name::<Self>()
    }

    fn methods(methods: &mut MethodSet<Self>);
}

enum Failure {
    Params(serde_json::Error),
    Reply(serde_json::Error),
    Application(RpcError),
}

type Invoke<S> = Box<dyn Fn(&S, Value) -> Result<Value, Failure> + Send + Sync>;
type Handler = Arc<dyn Fn(Value) -> Result<Value, Failure> + Send + Sync>;

/// Methods declared by a service during registration.
pub struct MethodSet<S> {
    entries: Vec<(String, String, Invoke<S>)>,
}

impl<S: 'static> MethodSet<S> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Declare a method.
    pub fn add<A, R, F>(&mut self, name: &str, method: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&S, A) -> Result<R, RpcError> + Send + Sync + 'static,
    {
        let signature = format!(
            "fn({}) -> {}",
            short_type_name::<A>(),
            short_type_name::<R>()
        );
        let invoke: Invoke<S> = Box::new(move |service: &S, params: Value| {
            let args: A = serde_json::from_value(params).map_err(Failure::Params)?;
            let reply = method(service, args).map_err(Failure::Application)?;
            serde_json::to_value(reply).map_err(Failure::Reply)
        });
        self.entries.push((name.to_string(), signature, invoke));
        self
    }
}

struct Registered {
    descriptor: ServiceDescriptor,
    handlers: HashMap<String, Handler>,
}

/// Services exposed by one server instance.
///
/// Lookups take a shared lock and never wait on each other; registration
/// takes the exclusive lock.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<Registered>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under its own name.
    pub fn register<S: Service>(&self, service: S) -> Result<ServiceDescriptor, RegistrationError> {
        let name = service.name();
        self.register_name(&name, service)
    }

    /// Register `service` under an explicit name.
    pub fn register_name<S: Service>(
        &self,
        name: &str,
        service: S,
    ) -> Result<ServiceDescriptor, RegistrationError> {
        if !is_valid_name(name) {
            return Err(RegistrationError::InvalidServiceName(name.to_string()));
        }

        let mut set = MethodSet::new();
        S::methods(&mut set);
        if set.entries.is_empty() {
            return Err(RegistrationError::NoMethods(name.to_string()));
        }

        let service = Arc::new(service);
        let mut methods = BTreeMap::new();
        let mut handlers: HashMap<String, Handler> = HashMap::new();

        for (method, signature, invoke) in set.entries {
            if !is_valid_name(&method) {
                return Err(RegistrationError::InvalidMethodName {
                    service: name.to_string(),
                    method,
                });
            }
            if methods.contains_key(&method) {
                return Err(RegistrationError::DuplicateMethod {
                    service: name.to_string(),
                    method,
                });
            }

            debug!(service = name, method = %method, signature = %signature, "Method declared");
            let service = Arc::clone(&service);
            handlers.insert(
                method.clone(),
                Arc::new(move |params: Value| invoke(&service, params)),
            );
            methods.insert(method, signature);
        }

        let descriptor = ServiceDescriptor {
            name: name.to_string(),
            methods,
        };

        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(name) {
            return Err(RegistrationError::DuplicateService(name.to_string()));
        }
        services.insert(
            name.to_string(),
            Arc::new(Registered {
                descriptor: descriptor.clone(),
                handlers,
            }),
        );

        info!(service = name, methods = descriptor.methods.len(), "Service registered");
        Ok(descriptor)
    }

    /// Snapshot of every registered service, sorted by name.
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = services.values().map(|s| s.descriptor.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn resolve(&self, method: &str) -> Result<Handler, CallError> {
        let (service, name) = method
            .rsplit_once('.')
            .ok_or_else(|| CallError::MalformedMethod(method.to_string()))?;

        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let registered = services
            .get(service)
            .ok_or_else(|| CallError::ServiceNotFound(service.to_string()))?;
        registered
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| CallError::MethodNotFound(method.to_string()))
    }

    /// Invoke `Service.Method` with JSON params.
    ///
    /// Handlers are synchronous and run on the blocking pool, so a slow
    /// handler never stalls the connection tasks of other clients.
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let handler = self.resolve(method)?;

        let outcome = tokio::task::spawn_blocking(move || handler(params))
            .await
            .map_err(|_| CallError::HandlerAborted(method.to_string()))?;

        outcome.map_err(|failure| match failure {
            Failure::Params(e) => CallError::InvalidParams {
                method: method.to_string(),
                reason: e.to_string(),
            },
            Failure::Reply(e) => CallError::EncodeReply {
                method: method.to_string(),
                reason: e.to_string(),
            },
            Failure::Application(e) => CallError::Application(e),
        })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && !name.chars().any(char::is_whitespace)
}

/// Type name with module paths stripped, e.g. `Vec<String>`.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    let mut chars = full.chars().peekable();

    while let Some(c) = chars.next() {
        if c == ':' && chars.peek() == Some(&':') {
            chars.next();
            segment.clear();
        } else if c.is_alphanumeric() || c == '_' {
            segment.push(c);
        } else {
            out.push_str(&segment);
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(&segment);
    out
}
