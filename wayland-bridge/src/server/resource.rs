use std::{
    any::Any,
    fmt,
    sync::{Arc, OnceLock},
};

use crate::{
    codec,
    dispatch::{marshal_call, Dispatch, Implementation, MarshalError, Value},
    protocol::{same_interface, Interface, MessageDesc},
    registry::Peer,
    types::{BridgeError, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper},
};

use super::{as_peer, Client, DestroyListener, ServerBridge};

/// A protocol object of a client
///
/// Requests received by the resource are dispatched to the handlers of its [`Implementation`].
/// A new resource is free-standing until [`Client::add_resource`] hands it over to its client;
/// dropping a free-standing resource destroys the native object.
pub struct Resource {
    bridge: Arc<ServerBridge>,
    wrapper: NativeObjectWrapper,
    client: NativeHandle,
    interface: &'static Interface,
    version: u32,
    id: u32,
    implementation: Arc<Implementation<Resource>>,
    data: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl Resource {
    /// Create a resource for `client`
    ///
    /// `id` is the protocol id chosen by the client, or 0 for a server allocated id.
    pub fn new(
        client: &Arc<Client>,
        interface: &'static Interface,
        version: u32,
        id: u32,
        implementation: Arc<Implementation<Resource>>,
    ) -> Result<Arc<Self>, BridgeError> {
        if !same_interface(implementation.interface(), interface) {
            return Err(BridgeError::IllegalState("implementation is for another interface"));
        }
        let bridge = client.bridge();
        let library = bridge.library();
        let client_handle = client.handle()?;
        let handle = library.resource_create(client_handle, interface, version, id)?;
        let resource = Arc::new(Self {
            bridge: bridge.clone(),
            wrapper: NativeObjectWrapper::new(bridge.registry().clone()),
            client: client_handle,
            interface,
            version,
            id: library.resource_id(handle),
            implementation,
            data: OnceLock::new(),
        });
        let attached = resource.wrapper.attach_data(&as_peer(&resource), handle, |handle| {
            bridge.subscribe_destroy(&resource, handle, |resource| resource.wrapper.destroy_notify())
        });
        if let Err(err) = attached {
            library.resource_destroy(handle);
            return Err(err);
        }
        library.resource_set_dispatcher(handle, bridge.dispatcher());
        Ok(resource)
    }

    pub(crate) fn wrapper(&self) -> &NativeObjectWrapper {
        &self.wrapper
    }

    pub(crate) fn client_handle(&self) -> NativeHandle {
        self.client
    }

    /// The native resource
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    /// The client owning this resource
    pub fn client(&self) -> Result<Arc<Client>, BridgeError> {
        self.handle()?;
        Client::from_handle(&self.bridge, self.client)
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

    /// Run `listener` when the resource is destroyed
    pub fn add_destroy_listener(&self, listener: &Arc<DestroyListener>) -> Result<(), BridgeError> {
        listener.attach(self.bridge.library(), self.handle()?)
    }

    /// Send an event
    pub fn post_event(&self, opcode: u32, values: &[Value<'_>]) -> Result<(), BridgeError> {
        let handle = self.handle()?;
        let desc = self.interface.event(opcode).ok_or(MarshalError::InvalidOpcode { opcode })?;
        if desc.since > self.version {
            return Err(BridgeError::IllegalState("event is newer than the resource version"));
        }
        let args = marshal_call(self.interface.events, opcode, values)?;
        self.bridge.trace_send(self.interface.name, self.id, desc.name, &args);
        self.bridge.library().resource_post_event(handle, opcode, &args);
        Ok(())
    }

    /// Post a protocol error, the client is then disconnected
    pub fn post_error(&self, code: u32, message: &str) {
        if let Some(handle) = self.wrapper.handle() {
            let message = codec::error_message(message);
            self.bridge.library().resource_post_error(handle, code, &message);
        }
    }

    /// Post the "no memory" error
    pub fn post_no_memory(&self) {
        if let Some(handle) = self.wrapper.handle() {
            self.bridge.library().resource_post_no_memory(handle);
        }
    }

    /// Destroy the resource
    ///
    /// Destroying an already destroyed resource does nothing.
    pub fn destroy(&self) {
        if let Some(handle) = self.wrapper.begin_destroy() {
            self.bridge.library().resource_destroy(handle);
        }
        self.wrapper.finalize();
    }

    /// Lifecycle state of the resource
    pub fn state(&self) -> LifecycleState {
        self.wrapper.state()
    }
}

impl Peer for Resource {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.interface.name, self.id)
    }
}

impl Dispatch for Resource {
    fn inbound_messages(interface: &'static Interface) -> &'static [MessageDesc] {
        interface.requests
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
        Resource::post_error(self, code, message)
    }

    fn post_no_memory(&self) {
        Resource::post_no_memory(self)
    }

    fn debug_messages(&self) -> bool {
        self.bridge.debug()
    }

    fn after_destructor(resource: &Arc<Self>, _desc: &MessageDesc) {
        resource.destroy();
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        let library = self.bridge.library().clone();
        self.wrapper.release(|handle| library.resource_destroy(handle));
    }
}

impl fmt::Debug for Resource {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("interface", &self.interface.name)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("wrapper", &self.wrapper)
            .finish_non_exhaustive()
    }
}
