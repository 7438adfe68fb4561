use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
};

use crate::{
    dispatch::{marshal_call, Dispatch, Implementation, Value},
    protocol::{same_interface, ArgumentType, Interface, MessageDesc},
    registry::Peer,
    types::{BridgeError, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper},
};

use super::{as_peer, ClientBridge, Display, EventQueue};

/// A protocol object of a connection
///
/// Events received by the proxy are dispatched to the handlers of its [`Implementation`]. The
/// connection keeps the proxy alive until it is destroyed or the connection is closed.
pub struct Proxy {
    bridge: Arc<ClientBridge>,
    wrapper: NativeObjectWrapper,
    display: Weak<Display>,
    interface: &'static Interface,
    version: u32,
    id: u32,
    implementation: Arc<Implementation<Proxy>>,
    data: OnceLock<Box<dyn Any + Send + Sync>>,
    /// Kept alive while the proxy receives its events
    queue: Mutex<Option<Arc<EventQueue>>>,
}

impl Proxy {
    pub(crate) fn attach(
        display: &Arc<Display>,
        handle: NativeHandle,
        implementation: Arc<Implementation<Proxy>>,
        listen: bool,
    ) -> Result<Arc<Self>, BridgeError> {
        let bridge = display.bridge();
        let library = bridge.library();
        if bridge.registry().contains(handle) {
            return Err(BridgeError::AlreadyAssigned);
        }
        let proxy = Arc::new(Self {
            bridge: bridge.clone(),
            wrapper: NativeObjectWrapper::new(bridge.registry().clone()),
            display: Arc::downgrade(display),
            interface: implementation.interface(),
            // libwayland reports version 0 for wl_display
            version: library.proxy_version(handle).max(1),
            id: library.proxy_id(handle),
            implementation,
            data: OnceLock::new(),
            queue: Mutex::new(None),
        });
        proxy.wrapper.attach_data(&as_peer(&proxy), handle, |_| Ok(None))?;
        if let Err(err) = proxy.wrapper.mark_owned(None) {
            proxy.wrapper.finalize();
            return Err(err);
        }
        if listen {
            library.proxy_set_dispatcher(handle, bridge.dispatcher());
        }
        display.track(&proxy);
        Ok(proxy)
    }

    /// Take charge of a proxy created by the native library for a `new_id` event argument
    pub fn adopt(
        display: &Arc<Display>,
        handle: NativeHandle,
        implementation: Arc<Implementation<Proxy>>,
    ) -> Result<Arc<Self>, BridgeError> {
        Self::attach(display, handle, implementation, true)
    }

    /// The native proxy
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    /// The connection of the proxy, if it is still referenced
    pub fn display(&self) -> Option<Arc<Display>> {
        self.display.upgrade()
    }

    /// The protocol id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The version of the interface
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The interface
    pub fn interface(&self) -> &'static Interface {
        self.interface
    }

    /// Attach user data, this can only be done once
    pub fn set_data<T: Any + Send + Sync>(&self, data: T) -> Result<(), BridgeError> {
        self.data.set(Box::new(data)).map_err(|_| BridgeError::AlreadyAssigned)
    }

    /// The user data, if it was set with type `T`
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.get()?.downcast_ref()
    }

    fn queue(&self) -> MutexGuard<'_, Option<Arc<EventQueue>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver the events of the proxy through `queue`, or through the default queue of the
    /// connection if `None`
    ///
    /// Events already received stay in the queue they were sorted to.
    pub fn set_queue(&self, queue: Option<&Arc<EventQueue>>) -> Result<(), BridgeError> {
        let handle = self.handle()?;
        let target = match queue {
            Some(queue) => {
                let display = self.display.upgrade().ok_or(BridgeError::InvalidId)?;
                if !queue.belongs_to(&display) {
                    return Err(BridgeError::IllegalState("queue of another connection"));
                }
                Some(queue.handle()?)
            }
            None => None,
        };
        self.bridge.library().proxy_set_queue(handle, target);
        let previous = std::mem::replace(&mut *self.queue(), queue.cloned());
        drop(previous);
        Ok(())
    }

    /// Called when `queue` is destroyed
    pub(crate) fn leave_queue(&self, queue: &EventQueue) {
        let previous = {
            let mut current = self.queue();
            if !current.as_ref().map_or(false, |current| std::ptr::eq(Arc::as_ptr(current), queue)) {
                return;
            }
            current.take()
        };
        if let Some(handle) = self.wrapper.handle() {
            self.bridge.library().proxy_set_queue(handle, None);
        }
        drop(previous);
    }

    fn request(&self, opcode: u32) -> Result<&'static MessageDesc, BridgeError> {
        let desc = self
            .interface
            .request(opcode)
            .ok_or(crate::dispatch::MarshalError::InvalidOpcode { opcode })?;
        if desc.since > self.version {
            return Err(BridgeError::IllegalState("request is newer than the proxy version"));
        }
        Ok(desc)
    }

    /// Send a request that does not create an object
    ///
    /// The proxy is destroyed after sending a destructor request.
    pub fn marshal(&self, opcode: u32, values: &[Value<'_>]) -> Result<(), BridgeError> {
        let handle = self.handle()?;
        let desc = self.request(opcode)?;
        if desc.signature.contains(&ArgumentType::NewId) {
            return Err(BridgeError::IllegalState("request creates an object"));
        }
        let args = marshal_call(self.interface.requests, opcode, values)?;
        self.bridge.trace_send(self.interface.name, self.id, desc.name, &args);
        self.bridge.library().proxy_marshal(handle, opcode, &args, None)?;
        if desc.is_destructor {
            self.destroy();
        }
        Ok(())
    }

    /// Send a request creating an object of `interface` at `version`
    ///
    /// The `new_id` argument of `values` is a placeholder, the native library allocates the id.
    pub fn marshal_constructor(
        &self,
        opcode: u32,
        values: &[Value<'_>],
        interface: &'static Interface,
        version: u32,
        implementation: Arc<Implementation<Proxy>>,
    ) -> Result<Arc<Proxy>, BridgeError> {
        let handle = self.handle()?;
        let desc = self.request(opcode)?;
        if !same_interface(implementation.interface(), interface) {
            return Err(BridgeError::IllegalState("implementation is for another interface"));
        }
        if desc.child_interface.map_or(false, |child| !same_interface(child, interface)) {
            return Err(BridgeError::IllegalState("request creates an object of another interface"));
        }
        let display = self.display.upgrade().ok_or(BridgeError::InvalidId)?;
        let args = marshal_call(self.interface.requests, opcode, values)?;
        self.bridge.trace_send(self.interface.name, self.id, desc.name, &args);
        let library = self.bridge.library();
        let child = library
            .proxy_marshal(handle, opcode, &args, Some((interface, version)))?
            .ok_or(BridgeError::IllegalState("request does not create an object"))?;
        let proxy = Self::attach(&display, child, implementation, true).map_err(|err| {
            library.proxy_destroy(child);
            err
        })?;
        // the native proxy started on the queue of its parent
        *proxy.queue() = self.queue().clone();
        if desc.is_destructor {
            self.destroy();
        }
        Ok(proxy)
    }

    pub(crate) fn finalize(&self) {
        self.wrapper.finalize();
        let queue = self.queue().take();
        drop(queue);
    }

    /// Destroy the proxy
    ///
    /// Destroying an already destroyed proxy does nothing.
    pub fn destroy(&self) {
        if let Some(handle) = self.wrapper.begin_destroy() {
            self.bridge.library().proxy_destroy(handle);
        }
        self.finalize();
    }

    /// Lifecycle state of the proxy
    pub fn state(&self) -> LifecycleState {
        self.wrapper.state()
    }
}

impl Peer for Proxy {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.interface.name, self.id)
    }
}

impl Dispatch for Proxy {
    fn inbound_messages(interface: &'static Interface) -> &'static [MessageDesc] {
        interface.events
    }

    fn interface(&self) -> &'static Interface {
        self.interface
    }

    fn protocol_id(&self) -> u32 {
        self.id
    }

    fn implementation(&self) -> Option<Arc<Implementation<Self>>> {
        Some(self.implementation.clone())
    }

    fn post_error(&self, code: u32, message: &str) {
        // a client has no way to report errors to the server
        crate::log_error!("Error {} on {}@{}: {}", code, self.interface.name, self.id, message);
    }

    fn post_no_memory(&self) {
        crate::log_error!("Out of memory handling an event of {}@{}", self.interface.name, self.id);
    }

    fn debug_messages(&self) -> bool {
        self.bridge.debug()
    }

    fn after_destructor(proxy: &Arc<Self>, _desc: &MessageDesc) {
        proxy.destroy();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let library = self.bridge.library().clone();
        self.wrapper.release(|handle| library.proxy_destroy(handle));
    }
}

impl fmt::Debug for Proxy {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("interface", &self.interface.name)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("wrapper", &self.wrapper)
            .finish_non_exhaustive()
    }
}
