use std::{
    fmt,
    os::unix::io::RawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, OnceLock, PoisonError, Weak},
    time::Duration,
};

use crate::{
    dispatch::panic_message,
    native::{FdMask, SourceCallback, SourceEvent},
    registry::Peer,
    types::{BridgeError, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper},
};

use super::{as_peer, ServerBridge};

/// An event loop
///
/// Either the loop of a [`Display`](super::Display), which lives as long as its display, or a
/// standalone loop created with [`EventLoop::create`] and destroyed when its last reference is
/// dropped.
pub struct EventLoop {
    bridge: Arc<ServerBridge>,
    wrapper: NativeObjectWrapper,
    standalone: bool,
}

impl EventLoop {
    /// Create a standalone event loop
    pub fn create(bridge: &Arc<ServerBridge>) -> Result<Arc<Self>, BridgeError> {
        let handle = bridge.library().event_loop_create()?;
        Self::attach(bridge, handle, true).map_err(|err| {
            bridge.library().event_loop_destroy(handle);
            err
        })
    }

    pub(crate) fn attach(
        bridge: &Arc<ServerBridge>,
        handle: NativeHandle,
        standalone: bool,
    ) -> Result<Arc<Self>, BridgeError> {
        let event_loop = Arc::new(Self {
            bridge: bridge.clone(),
            wrapper: NativeObjectWrapper::new(bridge.registry().clone()),
            standalone,
        });
        event_loop.wrapper.attach_data(&as_peer(&event_loop), handle, |handle| {
            bridge.subscribe_destroy(&event_loop, handle, |event_loop| {
                event_loop.wrapper.destroy_notify()
            })
        })?;
        Ok(event_loop)
    }

    /// The native event loop
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    fn add_source(
        &self,
        kind: SourceKind,
        callback: SourceCallback,
        cell: &SourceCell,
    ) -> Result<Arc<EventSource>, BridgeError> {
        let event_loop = self.handle()?;
        let library = self.bridge.library();
        let handle = match kind {
            SourceKind::Fd { fd, mask } => library.event_loop_add_fd(event_loop, fd, mask, callback)?,
            SourceKind::Timer => library.event_loop_add_timer(event_loop, callback)?,
            SourceKind::Signal(signal) => library.event_loop_add_signal(event_loop, signal, callback)?,
            SourceKind::Idle => library.event_loop_add_idle(event_loop, callback)?,
        };
        let source = Arc::new(EventSource {
            bridge: self.bridge.clone(),
            wrapper: NativeObjectWrapper::new(self.bridge.registry().clone()),
            kind,
        });
        let _ = cell.set(Arc::downgrade(&source));
        // sources die with their loop
        let attached = source.wrapper.attach_data(&as_peer(&source), handle, |_| {
            self.bridge.subscribe_destroy(&source, event_loop, |source| source.wrapper.destroy_notify())
        });
        let owned = attached.and_then(|()| source.wrapper.mark_owned(None));
        if let Err(err) = owned {
            source.wrapper.unsubscribe();
            source.wrapper.finalize();
            library.event_source_remove(handle);
            return Err(err);
        }
        Ok(source)
    }

    /// Watch `fd` for the events of `mask`
    ///
    /// The handler returns the value native callbacks return, see [`EventSource::check`].
    pub fn add_fd<F>(&self, fd: RawFd, mask: FdMask, handler: F) -> Result<Arc<EventSource>, BridgeError>
    where
        F: Fn(RawFd, FdMask) -> i32 + Send + Sync + 'static,
    {
        let cell = SourceCell::default();
        let callback = guarded(cell.clone(), move |event| match event {
            SourceEvent::Fd { fd, mask } => handler(fd, mask),
            _ => 0,
        });
        self.add_source(SourceKind::Fd { fd, mask }, callback, &cell)
    }

    /// Add a timer, disarmed until [`EventSource::update_timer`] is called
    pub fn add_timer<F>(&self, handler: F) -> Result<Arc<EventSource>, BridgeError>
    where
        F: Fn() -> i32 + Send + Sync + 'static,
    {
        let cell = SourceCell::default();
        let callback = guarded(cell.clone(), move |_| handler());
        self.add_source(SourceKind::Timer, callback, &cell)
    }

    /// Watch the signal `signal`
    pub fn add_signal<F>(&self, signal: i32, handler: F) -> Result<Arc<EventSource>, BridgeError>
    where
        F: Fn(i32) -> i32 + Send + Sync + 'static,
    {
        let cell = SourceCell::default();
        let callback = guarded(cell.clone(), move |event| match event {
            SourceEvent::Signal(signal) => handler(signal),
            _ => 0,
        });
        self.add_source(SourceKind::Signal(signal), callback, &cell)
    }

    /// Run `handler` once, the next time the loop is idle
    ///
    /// The source is released once the handler ran.
    pub fn add_idle<F>(&self, handler: F) -> Result<Arc<EventSource>, BridgeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let cell = SourceCell::default();
        let handler = Mutex::new(Some(handler));
        let fired = cell.clone();
        let callback = guarded(cell.clone(), move |_| {
            let handler = handler.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handler) = handler {
                handler();
            }
            // the native library drops idle sources once they ran
            if let Some(source) = fired.get().and_then(Weak::upgrade) {
                source.wrapper.unsubscribe();
                source.wrapper.finalize();
            }
            0
        });
        self.add_source(SourceKind::Idle, callback, &cell)
    }

    /// Wait at most `timeout` for events and dispatch them, `None` waits until an event arrives
    pub fn dispatch(&self, timeout: Option<Duration>) -> Result<(), BridgeError> {
        Ok(self.bridge.library().event_loop_dispatch(self.handle()?, timeout)?)
    }

    /// Run the idle sources
    pub fn dispatch_idle(&self) -> Result<(), BridgeError> {
        self.bridge.library().event_loop_dispatch_idle(self.handle()?);
        Ok(())
    }

    /// A file descriptor that becomes readable when the loop has events to dispatch
    pub fn fd(&self) -> Result<RawFd, BridgeError> {
        Ok(self.bridge.library().event_loop_fd(self.handle()?)?)
    }

    /// Destroy a standalone loop and its sources
    ///
    /// The loop of a display is destroyed with its display.
    pub fn destroy(&self) -> Result<(), BridgeError> {
        if !self.standalone {
            return Err(BridgeError::IllegalState("the event loop of a display cannot be destroyed"));
        }
        if let Some(handle) = self.wrapper.begin_destroy() {
            self.bridge.library().event_loop_destroy(handle);
        }
        self.wrapper.finalize();
        Ok(())
    }

    /// Whether the loop was created with [`EventLoop::create`]
    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    /// Lifecycle state of the loop
    pub fn state(&self) -> LifecycleState {
        self.wrapper.state()
    }
}

impl Peer for EventLoop {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let library = self.bridge.library().clone();
        if self.standalone {
            self.wrapper.release(|handle| library.event_loop_destroy(handle));
        } else {
            self.wrapper.unsubscribe();
            self.wrapper.finalize();
        }
    }
}

impl fmt::Debug for EventLoop {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("standalone", &self.standalone)
            .field("wrapper", &self.wrapper)
            .finish_non_exhaustive()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SourceKind {
    Fd { fd: RawFd, mask: FdMask },
    Timer,
    Signal(i32),
    Idle,
}

type SourceCell = Arc<OnceLock<Weak<EventSource>>>;

/// Wrap a source handler so that a panic does not unwind into the native library
fn guarded<F>(cell: SourceCell, handler: F) -> SourceCallback
where
    F: Fn(SourceEvent) -> i32 + Send + Sync + 'static,
{
    Arc::new(move |event| match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(ret) => ret,
        Err(payload) => {
            let source = cell.get().and_then(Weak::upgrade);
            crate::log_error!(
                "Handler of event source {:?} panicked: {}",
                source.and_then(|s| s.native_handle()),
                panic_message(&*payload)
            );
            0
        }
    })
}

/// A source registered on an [`EventLoop`]
///
/// The loop keeps the source alive until [`EventSource::remove`] is called or the loop is
/// destroyed.
pub struct EventSource {
    bridge: Arc<ServerBridge>,
    wrapper: NativeObjectWrapper,
    kind: SourceKind,
}

impl EventSource {
    /// The native event source
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    /// Change the events watched by an fd source
    pub fn update_fd(&self, mask: FdMask) -> Result<(), BridgeError> {
        if !matches!(self.kind, SourceKind::Fd { .. }) {
            return Err(BridgeError::IllegalState("not a file descriptor source"));
        }
        Ok(self.bridge.library().event_source_fd_update(self.handle()?, mask)?)
    }

    /// Arm a timer to fire in `ms` milliseconds, 0 disarms it
    pub fn update_timer(&self, ms: u32) -> Result<(), BridgeError> {
        if self.kind != SourceKind::Timer {
            return Err(BridgeError::IllegalState("not a timer source"));
        }
        Ok(self.bridge.library().event_source_timer_update(self.handle()?, ms)?)
    }

    /// Ask for the source to be dispatched again as long as its handler returns a positive value
    pub fn check(&self) -> Result<(), BridgeError> {
        self.bridge.library().event_source_check(self.handle()?);
        Ok(())
    }

    /// Remove the source from its loop
    ///
    /// Removing an already removed source does nothing.
    pub fn remove(&self) {
        self.wrapper.unsubscribe();
        if let Some(handle) = self.wrapper.begin_destroy() {
            self.bridge.library().event_source_remove(handle);
        }
        self.wrapper.finalize();
    }

    /// Lifecycle state of the source
    pub fn state(&self) -> LifecycleState {
        self.wrapper.state()
    }
}

impl Peer for EventSource {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        let library = self.bridge.library().clone();
        self.wrapper.release(|handle| library.event_source_remove(handle));
    }
}

impl fmt::Debug for EventSource {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("kind", &self.kind)
            .field("wrapper", &self.wrapper)
            .finish_non_exhaustive()
    }
}
