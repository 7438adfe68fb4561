use std::{
    fmt,
    os::unix::io::{OwnedFd, RawFd},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
};

use crate::{
    core_interfaces::{
        WL_CALLBACK_INTERFACE, WL_DISPLAY_GET_REGISTRY, WL_DISPLAY_INTERFACE, WL_DISPLAY_SYNC,
        WL_REGISTRY_INTERFACE,
    },
    dispatch::{Implementation, Value},
    protocol::ProtocolError,
    registry::Peer,
    types::{BridgeError, HandleKind, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper},
};

use super::{as_peer, ClientBridge, EventQueue, Proxy};

/// A connection to a Wayland server
///
/// The connection is free-standing: dropping its last reference disconnects, which destroys all
/// its proxies and event queues.
pub struct Display {
    bridge: Arc<ClientBridge>,
    wrapper: NativeObjectWrapper,
    proxy: OnceLock<Arc<Proxy>>,
    proxies: Mutex<Vec<Weak<Proxy>>>,
    queues: Mutex<Vec<Weak<EventQueue>>>,
}

impl Display {
    /// Connect to the server socket `name`, or to `WAYLAND_DISPLAY` if `None`
    pub fn connect(bridge: &Arc<ClientBridge>, name: Option<&str>) -> Result<Arc<Self>, BridgeError> {
        let connection = bridge.library().display_connect(name)?;
        Self::from_connection(bridge, connection)
    }

    /// Use an already connected socket
    pub fn connect_to_fd(bridge: &Arc<ClientBridge>, fd: OwnedFd) -> Result<Arc<Self>, BridgeError> {
        let connection = bridge.library().display_connect_to_fd(fd)?;
        Self::from_connection(bridge, connection)
    }

    fn from_connection(
        bridge: &Arc<ClientBridge>,
        connection: NativeHandle,
    ) -> Result<Arc<Self>, BridgeError> {
        let display = Arc::new(Self {
            bridge: bridge.clone(),
            wrapper: NativeObjectWrapper::new(bridge.registry().clone()),
            proxy: OnceLock::new(),
            proxies: Mutex::new(Vec::new()),
            queues: Mutex::new(Vec::new()),
        });
        // there is no destroy signal on the client side
        if let Err(err) = display.wrapper.attach_data(&as_peer(&display), connection, |_| Ok(None)) {
            bridge.library().display_disconnect(connection);
            return Err(err);
        }
        let proxy = Proxy::attach(
            &display,
            connection.with_kind(HandleKind::Proxy),
            Implementation::empty(&WL_DISPLAY_INTERFACE),
            false,
        )?;
        let _ = display.proxy.set(proxy);
        Ok(display)
    }

    fn proxies(&self) -> MutexGuard<'_, Vec<Weak<Proxy>>> {
        self.proxies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn track(&self, proxy: &Arc<Proxy>) {
        let mut proxies = self.proxies();
        proxies.retain(|p| p.strong_count() > 0);
        proxies.push(Arc::downgrade(proxy));
    }

    fn queues(&self) -> MutexGuard<'_, Vec<Weak<EventQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn track_queue(&self, queue: &Arc<EventQueue>) {
        let mut queues = self.queues();
        queues.retain(|q| q.strong_count() > 0);
        queues.push(Arc::downgrade(queue));
    }

    /// Move the proxies on `queue` back to the default queue
    pub(crate) fn leave_queue(&self, queue: &EventQueue) {
        let proxies: Vec<Arc<Proxy>> = self.proxies().iter().filter_map(Weak::upgrade).collect();
        for proxy in proxies {
            proxy.leave_queue(queue);
        }
    }

    /// libwayland-client requires the queues to go before the connection
    fn destroy_queues(&self) {
        let queues = std::mem::take(&mut *self.queues());
        for queue in queues.iter().filter_map(Weak::upgrade) {
            queue.destroy();
        }
    }

    /// The bridge this connection belongs to
    pub fn bridge(&self) -> &Arc<ClientBridge> {
        &self.bridge
    }

    /// The native connection
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    /// The `wl_display` object
    pub fn proxy(&self) -> Result<&Arc<Proxy>, BridgeError> {
        self.handle()?;
        self.proxy.get().ok_or(BridgeError::InvalidId)
    }

    /// Read and dispatch events, returns the number of dispatched events
    pub fn dispatch(&self) -> Result<usize, BridgeError> {
        Ok(self.bridge.library().display_dispatch(self.handle()?)?)
    }

    /// Dispatch the events already received
    pub fn dispatch_pending(&self) -> Result<usize, BridgeError> {
        Ok(self.bridge.library().display_dispatch_pending(self.handle()?)?)
    }

    /// Create an event queue on the connection
    pub fn create_queue(self: &Arc<Self>) -> Result<Arc<EventQueue>, BridgeError> {
        EventQueue::new(self)
    }

    /// Read events and dispatch those of `queue`, blocking until at least one is available
    pub fn dispatch_queue(&self, queue: &EventQueue) -> Result<usize, BridgeError> {
        let queue = self.queue_handle(queue)?;
        Ok(self.bridge.library().display_dispatch_queue(self.handle()?, queue)?)
    }

    /// Dispatch the events of `queue` already received
    pub fn dispatch_queue_pending(&self, queue: &EventQueue) -> Result<usize, BridgeError> {
        let queue = self.queue_handle(queue)?;
        Ok(self.bridge.library().display_dispatch_queue_pending(self.handle()?, queue)?)
    }

    fn queue_handle(&self, queue: &EventQueue) -> Result<NativeHandle, BridgeError> {
        if !queue.belongs_to(self) {
            return Err(BridgeError::IllegalState("queue of another connection"));
        }
        queue.handle()
    }

    /// The file descriptor of the connection, to poll for incoming events
    ///
    /// It stays owned by the connection and is closed when it disconnects.
    pub fn fd(&self) -> Result<RawFd, BridgeError> {
        Ok(self.bridge.library().display_get_fd(self.handle()?)?)
    }

    /// Send the pending requests
    pub fn flush(&self) -> Result<(), BridgeError> {
        Ok(self.bridge.library().display_flush(self.handle()?)?)
    }

    /// Wait for the server to process every request sent so far, dispatching the events received
    /// meanwhile
    pub fn roundtrip(&self) -> Result<usize, BridgeError> {
        Ok(self.bridge.library().display_roundtrip(self.handle()?)?)
    }

    /// Send `wl_display.sync`, the returned callback receives `done` once the server processed it
    pub fn sync(
        &self,
        implementation: Arc<Implementation<Proxy>>,
    ) -> Result<Arc<Proxy>, BridgeError> {
        self.proxy()?.marshal_constructor(
            WL_DISPLAY_SYNC,
            &[Value::NewId(0)],
            &WL_CALLBACK_INTERFACE,
            1,
            implementation,
        )
    }

    /// Create a registry, which receives the globals of the server
    pub fn get_registry(
        &self,
        implementation: Arc<Implementation<Proxy>>,
    ) -> Result<Arc<Proxy>, BridgeError> {
        self.proxy()?.marshal_constructor(
            WL_DISPLAY_GET_REGISTRY,
            &[Value::NewId(0)],
            &WL_REGISTRY_INTERFACE,
            1,
            implementation,
        )
    }

    /// The protocol error that killed the connection, if any
    pub fn protocol_error(&self) -> Option<ProtocolError> {
        let handle = self.wrapper.handle()?;
        self.bridge.library().display_protocol_error(handle)
    }

    fn finalize_proxies(&self) {
        let proxies = std::mem::take(&mut *self.proxies());
        for proxy in proxies.iter().filter_map(Weak::upgrade) {
            proxy.finalize();
        }
    }

    /// Close the connection, its proxies and event queues are destroyed
    ///
    /// Disconnecting twice does nothing.
    pub fn disconnect(&self) {
        if let Some(handle) = self.wrapper.begin_destroy() {
            self.destroy_queues();
            self.bridge.library().display_disconnect(handle);
        }
        self.wrapper.finalize();
        self.finalize_proxies();
    }

    /// Lifecycle state of the connection
    pub fn state(&self) -> LifecycleState {
        self.wrapper.state()
    }
}

impl Peer for Display {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        let library = self.bridge.library().clone();
        self.destroy_queues();
        self.wrapper.release(|handle| library.display_disconnect(handle));
        self.finalize_proxies();
    }
}

impl fmt::Debug for Display {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Display").field("wrapper", &self.wrapper).finish_non_exhaustive()
    }
}
