use std::{
    fmt,
    os::unix::io::OwnedFd,
    sync::{Arc, OnceLock},
    time::Duration,
};

use crate::{
    registry::Peer,
    types::{BridgeError, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper},
};

use super::{as_peer, Client, DestroyListener, EventLoop, ServerBridge};

/// A Wayland server display
///
/// The display is free-standing: dropping its last reference destroys the native display, along
/// with its clients and globals.
pub struct Display {
    bridge: Arc<ServerBridge>,
    wrapper: NativeObjectWrapper,
    event_loop: OnceLock<Arc<EventLoop>>,
}

impl Display {
    /// Create a new display
    pub fn create(bridge: &Arc<ServerBridge>) -> Result<Arc<Self>, BridgeError> {
        let library = bridge.library();
        let handle = library.display_create()?;
        let display = Arc::new(Self {
            bridge: bridge.clone(),
            wrapper: NativeObjectWrapper::new(bridge.registry().clone()),
            event_loop: OnceLock::new(),
        });
        let attached = display.wrapper.attach_data(&as_peer(&display), handle, |handle| {
            bridge.subscribe_destroy(&display, handle, |display| display.wrapper.destroy_notify())
        });
        if let Err(err) = attached {
            library.display_destroy(handle);
            return Err(err);
        }
        Ok(display)
    }

    /// The bridge this display belongs to
    pub fn bridge(&self) -> &Arc<ServerBridge> {
        &self.bridge
    }

    /// The native display
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    /// The event loop of the display
    pub fn event_loop(&self) -> Result<Arc<EventLoop>, BridgeError> {
        if let Some(event_loop) = self.event_loop.get() {
            return Ok(event_loop.clone());
        }
        let native = self.bridge.library().display_event_loop(self.handle()?);
        let event_loop = EventLoop::attach(&self.bridge, native, false)?;
        // another thread may have won the race, keep the first peer
        Ok(self.event_loop.get_or_init(|| event_loop).clone())
    }

    /// Listen on a socket named `name`, or on the first free `wayland-N` if `None`
    ///
    /// Returns the name of the socket.
    pub fn add_socket(&self, name: Option<&str>) -> Result<String, BridgeError> {
        Ok(self.bridge.library().display_add_socket(self.handle()?, name)?)
    }

    /// Listen on the first free `wayland-N` socket
    pub fn add_socket_auto(&self) -> Result<String, BridgeError> {
        self.add_socket(None)
    }

    /// Make [`Display::run`] return
    pub fn terminate(&self) {
        if let Some(handle) = self.wrapper.handle() {
            self.bridge.library().display_terminate(handle);
        }
    }

    /// Dispatch the event loop until [`Display::terminate`] is called
    pub fn run(&self) -> Result<(), BridgeError> {
        self.bridge.library().display_run(self.handle()?);
        Ok(())
    }

    /// Dispatch the event loop once, waiting at most `timeout` for events
    pub fn dispatch(&self, timeout: Option<Duration>) -> Result<(), BridgeError> {
        self.event_loop()?.dispatch(timeout)
    }

    /// Send the pending events of every client
    pub fn flush_clients(&self) {
        if let Some(handle) = self.wrapper.handle() {
            self.bridge.library().display_flush_clients(handle);
        }
    }

    /// The last serial
    pub fn serial(&self) -> Result<u32, BridgeError> {
        Ok(self.bridge.library().display_serial(self.handle()?))
    }

    /// Increment the serial and return it
    pub fn next_serial(&self) -> Result<u32, BridgeError> {
        Ok(self.bridge.library().display_next_serial(self.handle()?))
    }

    /// Create a client from a connected socket
    pub fn create_client(&self, fd: OwnedFd) -> Result<Arc<Client>, BridgeError> {
        let native = self.bridge.library().client_create(self.handle()?, fd)?;
        Client::from_handle(&self.bridge, native).map_err(|err| {
            self.bridge.library().client_destroy(native);
            err
        })
    }

    /// Run `listener` when the display is destroyed
    pub fn add_destroy_listener(&self, listener: &Arc<DestroyListener>) -> Result<(), BridgeError> {
        listener.attach(self.bridge.library(), self.handle()?)
    }

    /// Destroy the display, its clients and its globals
    ///
    /// Destroying an already destroyed display does nothing.
    pub fn destroy(&self) {
        if let Some(handle) = self.wrapper.begin_destroy() {
            self.bridge.library().display_destroy(handle);
        }
        self.wrapper.finalize();
    }

    /// Lifecycle state of the display
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
        self.wrapper.release(|handle| library.display_destroy(handle));
    }
}

impl fmt::Debug for Display {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Display").field("wrapper", &self.wrapper).finish_non_exhaustive()
    }
}
