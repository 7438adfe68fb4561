use std::{
    fmt, ptr,
    sync::{Arc, Weak},
};

use crate::{
    registry::Peer,
    types::{BridgeError, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper},
};

use super::{as_peer, ClientBridge, Display};

/// A queue of events of a connection
///
/// The events of a proxy moved to the queue with [`Proxy::set_queue`](super::Proxy::set_queue) are
/// only dispatched by [`Display::dispatch_queue`] and [`Display::dispatch_queue_pending`], so that
/// a thread can handle its own objects of a shared connection. Proxies created by a request or an
/// event of such a proxy start on the same queue.
///
/// The queue is free-standing: dropping its last reference destroys it. A proxy on the queue keeps
/// it alive, and closing the connection destroys it first.
pub struct EventQueue {
    bridge: Arc<ClientBridge>,
    wrapper: NativeObjectWrapper,
    display: Weak<Display>,
}

impl EventQueue {
    /// Create an event queue on `display`
    pub fn new(display: &Arc<Display>) -> Result<Arc<Self>, BridgeError> {
        let bridge = display.bridge();
        let handle = bridge.library().display_create_queue(display.handle()?)?;
        let queue = Arc::new(Self {
            bridge: bridge.clone(),
            wrapper: NativeObjectWrapper::new(bridge.registry().clone()),
            display: Arc::downgrade(display),
        });
        if let Err(err) = queue.wrapper.attach_data(&as_peer(&queue), handle, |_| Ok(None)) {
            bridge.library().event_queue_destroy(handle);
            return Err(err);
        }
        display.track_queue(&queue);
        Ok(queue)
    }

    /// The native queue
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    /// The connection of the queue, if it is still referenced
    pub fn display(&self) -> Option<Arc<Display>> {
        self.display.upgrade()
    }

    pub(crate) fn belongs_to(&self, display: &Display) -> bool {
        ptr::eq(self.display.as_ptr(), display)
    }

    /// Destroy the queue
    ///
    /// Proxies still on the queue go back to the default queue, the events it holds are dropped.
    /// Destroying an already destroyed queue does nothing.
    pub fn destroy(&self) {
        let Some(handle) = self.wrapper.begin_destroy() else {
            return;
        };
        if let Some(display) = self.display.upgrade() {
            display.leave_queue(self);
        }
        self.bridge.library().event_queue_destroy(handle);
        self.wrapper.finalize();
    }

    /// Lifecycle state of the queue
    pub fn state(&self) -> LifecycleState {
        self.wrapper.state()
    }
}

impl Peer for EventQueue {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        let library = self.bridge.library().clone();
        self.wrapper.release(|handle| library.event_queue_destroy(handle));
    }
}

impl fmt::Debug for EventQueue {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue").field("wrapper", &self.wrapper).finish_non_exhaustive()
    }
}
