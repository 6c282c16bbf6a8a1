//! Server-side namespace of callable methods.
//!
//! A [`Context`] owns a tree of [`Instance`]s keyed by path (`"/"` is the
//! root); each instance owns interfaces, each interface owns methods.
//! Dispatch is an exact-match lookup of `path -> interface -> method`;
//! wildcards exist only for event subscriptions, never for dispatch.
//!
//! A context is shared between the server and any in-process agent that
//! registers methods; clones share the same registry.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use crate::call::ServerCallContext;
use crate::error::{Result, RpcError};
use crate::object::Object;

/// Interface used when registration or dispatch does not name one.
pub const DEFAULT_INTERFACE: &str = "com.colloquy.Default";

/// Path of the root instance, always present.
pub const ROOT_PATH: &str = "/";

/// Opaque per-instance argument handed to handlers.
pub type InstanceArg = Arc<dyn Any + Send + Sync>;

/// A dispatchable method body.
pub type Handler = Arc<
    dyn Fn(ServerCallContext, Object) -> BoxFuture<'static, Result<Object>> + Send + Sync,
>;

/// Fully qualified address of a method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodAddress {
    pub path: String,
    pub interface: String,
    pub method: String,
}

impl fmt::Display for MethodAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.path, self.interface, self.method)
    }
}

/// Hook run before every dispatch. May replace the arguments (`Ok(Some)`)
/// or reject the call outright (`Err`).
pub type PreCallHook =
    Arc<dyn Fn(&MethodAddress, &Object) -> Result<Option<Object>> + Send + Sync>;

/// Hook run after a handler retires.
pub type PostCallHook = Arc<dyn Fn(&MethodAddress) + Send + Sync>;

/// A registered method: name, optional description, handler.
#[derive(Clone)]
pub struct RegisteredMethod {
    pub name: String,
    pub description: Option<String>,
    pub(crate) handler: Handler,
}

impl fmt::Debug for RegisteredMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMethod")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Clone)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

struct InterfaceInner {
    name: String,
    methods: RwLock<HashMap<String, RegisteredMethod>>,
}

impl Interface {
    fn new(name: &str) -> Self {
        Interface {
            inner: Arc::new(InterfaceInner {
                name: name.to_owned(),
                methods: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn register_method(
        &self,
        name: &str,
        description: Option<&str>,
        handler: Handler,
    ) -> Result<()> {
        let mut methods = self.inner.methods.write();
        if methods.contains_key(name) {
            return Err(RpcError::invalid_arguments(format!(
                "method {:?} is already registered on interface {:?}",
                name, self.inner.name
            )));
        }
        methods.insert(
            name.to_owned(),
            RegisteredMethod {
                name: name.to_owned(),
                description: description.map(str::to_owned),
                handler,
            },
        );
        Ok(())
    }

    pub fn unregister_method(&self, name: &str) -> bool {
        self.inner.methods.write().remove(name).is_some()
    }

    pub fn find_method(&self, name: &str) -> Option<RegisteredMethod> {
        self.inner.methods.read().get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        self.inner.methods.read().keys().cloned().collect()
    }

    fn methods(&self) -> Vec<RegisteredMethod> {
        self.inner.methods.read().values().cloned().collect()
    }
}

#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("path", &self.inner.path)
            .finish()
    }
}

struct InstanceInner {
    path: String,
    description: RwLock<Option<String>>,
    arg: RwLock<Option<InstanceArg>>,
    interfaces: RwLock<HashMap<String, Interface>>,
}

impl Instance {
    fn new(path: &str) -> Self {
        Instance {
            inner: Arc::new(InstanceInner {
                path: path.to_owned(),
                description: RwLock::new(None),
                arg: RwLock::new(None),
                interfaces: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn description(&self) -> Option<String> {
        self.inner.description.read().clone()
    }

    pub fn set_description(&self, description: &str) {
        *self.inner.description.write() = Some(description.to_owned());
    }

    /// The opaque argument handed to every handler dispatched on this
    /// instance.
    pub fn set_arg(&self, arg: InstanceArg) {
        *self.inner.arg.write() = Some(arg);
    }

    pub fn arg(&self) -> Option<InstanceArg> {
        self.inner.arg.read().clone()
    }

    /// Get or create the named interface.
    pub fn register_interface(&self, name: &str) -> Interface {
        let mut interfaces = self.inner.interfaces.write();
        interfaces
            .entry(name.to_owned())
            .or_insert_with(|| Interface::new(name))
            .clone()
    }

    pub fn find_interface(&self, name: &str) -> Option<Interface> {
        self.inner.interfaces.read().get(name).cloned()
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.inner.interfaces.read().keys().cloned().collect()
    }

    fn interfaces(&self) -> Vec<Interface> {
        self.inner.interfaces.read().values().cloned().collect()
    }
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    instances: RwLock<HashMap<String, Instance>>,
    pre_call_hook: RwLock<Option<PreCallHook>>,
    post_call_hook: RwLock<Option<PostCallHook>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        let context = Context {
            inner: Arc::new(ContextInner {
                instances: RwLock::new(HashMap::new()),
                pre_call_hook: RwLock::new(None),
                post_call_hook: RwLock::new(None),
            }),
        };
        context
            .inner
            .instances
            .write()
            .insert(ROOT_PATH.to_owned(), Instance::new(ROOT_PATH));
        context
    }

    /// Register a fresh instance at `path`.
    pub fn register_instance(&self, path: &str) -> Result<Instance> {
        let mut instances = self.inner.instances.write();
        if instances.contains_key(path) {
            return Err(RpcError::invalid_arguments(format!(
                "instance {:?} is already registered",
                path
            )));
        }
        let instance = Instance::new(path);
        instances.insert(path.to_owned(), instance.clone());
        Ok(instance)
    }

    /// Remove an instance and its subtree.
    pub fn unregister_instance(&self, path: &str) -> bool {
        let mut instances = self.inner.instances.write();
        let prefix = if path.ends_with('/') {
            path.to_owned()
        } else {
            format!("{}/", path)
        };
        let before = instances.len();
        instances.retain(|key, _| key != path && !key.starts_with(&prefix));
        instances.len() != before
    }

    pub fn find_instance(&self, path: &str) -> Option<Instance> {
        self.inner.instances.read().get(path).cloned()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.inner.instances.read().values().cloned().collect()
    }

    /// Register a handler under `path` (default `/`) and `interface`
    /// (default [`DEFAULT_INTERFACE`]).
    pub fn register_method(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        name: &str,
        description: Option<&str>,
        handler: Handler,
    ) -> Result<()> {
        let path = path.unwrap_or(ROOT_PATH);
        let interface = interface.unwrap_or(DEFAULT_INTERFACE);
        let instance = self
            .find_instance(path)
            .ok_or_else(|| RpcError::not_found(format!("unknown instance {:?}", path)))?;
        instance
            .register_interface(interface)
            .register_method(name, description, handler)
    }

    /// Register a plain function returning a single reply.
    pub fn register_func<F>(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        name: &str,
        f: F,
    ) -> Result<()>
    where
        F: Fn(ServerCallContext, Object) -> Result<Object> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |cx, args| {
            let f = f.clone();
            Box::pin(async move { f(cx, args) })
        });
        self.register_method(path, interface, name, None, handler)
    }

    /// Register an async handler. Streaming handlers use the yield primitive
    /// on their [`ServerCallContext`] and return when the stream is done.
    pub fn register_async<F, Fut>(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        name: &str,
        f: F,
    ) -> Result<()>
    where
        F: Fn(ServerCallContext, Object) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Object>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |cx, args| Box::pin(f(cx, args)));
        self.register_method(path, interface, name, None, handler)
    }

    pub fn set_pre_call_hook(&self, hook: PreCallHook) {
        *self.inner.pre_call_hook.write() = Some(hook);
    }

    pub fn set_post_call_hook(&self, hook: PostCallHook) {
        *self.inner.post_call_hook.write() = Some(hook);
    }

    pub(crate) fn pre_call_hook(&self) -> Option<PreCallHook> {
        self.inner.pre_call_hook.read().clone()
    }

    pub(crate) fn post_call_hook(&self) -> Option<PostCallHook> {
        self.inner.post_call_hook.read().clone()
    }

    /// Exact-match dispatch lookup.
    pub(crate) fn lookup_method(
        &self,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Result<(Instance, RegisteredMethod)> {
        let instance = self
            .find_instance(path)
            .ok_or_else(|| RpcError::not_found(format!("unknown instance {:?}", path)))?;
        let iface = instance.find_interface(interface).ok_or_else(|| {
            RpcError::not_found(format!(
                "instance {:?} has no interface {:?}",
                path, interface
            ))
        })?;
        let registered = iface.find_method(method).ok_or_else(|| {
            RpcError::not_found(format!(
                "interface {:?} has no method {:?}",
                interface, method
            ))
        })?;
        Ok((instance, registered))
    }

    /// Discovery: array of `{path, description}` dictionaries.
    pub fn describe_instances(&self) -> Object {
        let mut instances = self.instances();
        instances.sort_by(|a, b| a.path().cmp(b.path()));
        Object::array(
            instances
                .iter()
                .map(|i| {
                    Object::dict_from([
                        ("path", Object::string(i.path())),
                        (
                            "description",
                            i.description().map(Object::string).unwrap_or_else(Object::null),
                        ),
                    ])
                })
                .collect(),
        )
    }

    /// Discovery: array of interface names on `path`.
    pub fn describe_interfaces(&self, path: &str) -> Result<Object> {
        let instance = self
            .find_instance(path)
            .ok_or_else(|| RpcError::not_found(format!("unknown instance {:?}", path)))?;
        let mut names = instance.interface_names();
        names.sort();
        Ok(Object::array(names.into_iter().map(Object::string).collect()))
    }

    /// Discovery: array of `{name, description, interface}` dictionaries for
    /// `path`, optionally narrowed to one interface.
    pub fn describe_methods(&self, path: &str, interface: Option<&str>) -> Result<Object> {
        let instance = self
            .find_instance(path)
            .ok_or_else(|| RpcError::not_found(format!("unknown instance {:?}", path)))?;

        let interfaces = match interface {
            Some(name) => vec![instance.find_interface(name).ok_or_else(|| {
                RpcError::not_found(format!("instance {:?} has no interface {:?}", path, name))
            })?],
            None => instance.interfaces(),
        };

        let mut entries: Vec<(String, String, Option<String>)> = Vec::new();
        for iface in interfaces {
            for method in iface.methods() {
                entries.push((iface.name().to_owned(), method.name, method.description));
            }
        }
        entries.sort();

        Ok(Object::array(
            entries
                .into_iter()
                .map(|(iface, name, description)| {
                    Object::dict_from([
                        ("name", Object::string(name)),
                        (
                            "description",
                            description.map(Object::string).unwrap_or_else(Object::null),
                        ),
                        ("interface", Object::string(iface)),
                    ])
                })
                .collect(),
        ))
    }
}
