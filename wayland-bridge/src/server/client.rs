use std::{fmt, sync::Arc};

use crate::{
    codec,
    dispatch::Implementation,
    protocol::Interface,
    registry::Peer,
    types::{BridgeError, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper},
};

use super::{as_peer, DestroyListener, Display, Resource, ServerBridge};

/// A client connected to a display
///
/// The display owns its clients: a client peer stays registered until the client disconnects or is
/// destroyed, even if Rust code does not reference it.
pub struct Client {
    bridge: Arc<ServerBridge>,
    wrapper: NativeObjectWrapper,
}

impl Client {
    /// The peer of a native client, created the first time the client is seen
    ///
    /// Creation is serialized per bridge so that concurrent lookups of a new client agree on a
    /// single peer.
    pub(crate) fn from_handle(
        bridge: &Arc<ServerBridge>,
        handle: NativeHandle,
    ) -> Result<Arc<Self>, BridgeError> {
        if let Some(client) = bridge.registry().find_as::<Self>(handle) {
            return Ok(client);
        }
        let guard = bridge.lock_client_creation();
        if let Some(client) = bridge.registry().find_as::<Self>(handle) {
            return Ok(client);
        }
        let client = Arc::new(Self {
            bridge: bridge.clone(),
            wrapper: NativeObjectWrapper::new(bridge.registry().clone()),
        });
        let attached = client
            .wrapper
            .attach_data(&as_peer(&client), handle, |handle| {
                bridge.subscribe_destroy(&client, handle, |client| client.wrapper.destroy_notify())
            })
            .and_then(|()| {
                client.wrapper.mark_owned(None).map_err(|err| {
                    client.wrapper.unsubscribe();
                    client.wrapper.finalize();
                    err
                })
            });
        // a failed peer is dropped after the lock is released
        drop(guard);
        attached.map(|()| client)
    }

    /// The native client
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    /// The bridge this client belongs to
    pub fn bridge(&self) -> &Arc<ServerBridge> {
        &self.bridge
    }

    /// Send the pending events of the client
    pub fn flush(&self) {
        if let Some(handle) = self.wrapper.handle() {
            self.bridge.library().client_flush(handle);
        }
    }

    /// Hand `resource` over to this client
    ///
    /// The client then keeps the resource alive until it is destroyed.
    pub fn add_resource(&self, resource: &Arc<Resource>) -> Result<(), BridgeError> {
        let handle = self.handle()?;
        if resource.client_handle() != handle {
            return Err(BridgeError::IllegalState("resource belongs to another client"));
        }
        resource.wrapper().mark_owned(Some(as_peer(resource)))
    }

    /// Create a resource with a server allocated id and hand it over to this client
    pub fn new_object(
        self: &Arc<Self>,
        interface: &'static Interface,
        version: u32,
        implementation: Arc<Implementation<Resource>>,
    ) -> Result<Arc<Resource>, BridgeError> {
        let resource = Resource::new(self, interface, version, 0, implementation)?;
        self.add_resource(&resource)?;
        Ok(resource)
    }

    /// Run `listener` when the client is destroyed
    pub fn add_destroy_listener(&self, listener: &Arc<DestroyListener>) -> Result<(), BridgeError> {
        listener.attach(self.bridge.library(), self.handle()?)
    }

    /// The display of the client, if its peer is still alive
    pub fn display(&self) -> Option<Arc<Display>> {
        let handle = self.wrapper.handle()?;
        let display = self.bridge.library().client_display(handle);
        self.bridge.registry().find_as::<Display>(display)
    }

    /// Disconnect the client, destroying its resources
    ///
    /// Destroying an already destroyed client does nothing.
    pub fn destroy(&self) {
        if let Some(handle) = self.wrapper.begin_destroy() {
            self.bridge.library().client_destroy(handle);
        }
        self.wrapper.finalize();
    }

    /// Post the "no memory" error to the client
    pub fn post_no_memory(&self) {
        if let Some(handle) = self.wrapper.handle() {
            self.bridge.library().client_post_no_memory(handle);
        }
    }

    /// Post an implementation error to the client
    pub fn post_error(&self, code: u32, message: &str) {
        if let Some(handle) = self.wrapper.handle() {
            let message = codec::error_message(message);
            self.bridge.library().client_post_error(handle, code, &message);
        }
    }

    /// Lifecycle state of the client
    pub fn state(&self) -> LifecycleState {
        self.wrapper.state()
    }
}

impl Peer for Client {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let library = self.bridge.library().clone();
        self.wrapper.release(|handle| library.client_destroy(handle));
    }
}

impl fmt::Debug for Client {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("wrapper", &self.wrapper).finish_non_exhaustive()
    }
}
