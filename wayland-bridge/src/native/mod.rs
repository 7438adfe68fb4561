//! The native library, as consumed by the bridge
//!
//! [`ServerLibrary`] and [`ClientLibrary`] expose the subset of `libwayland-server` and
//! `libwayland-client` the bridge relies on. Objects are designated by [`NativeHandle`]s, callbacks
//! into the bridge are trait objects the library keeps alive for as long as it may invoke them.
//!
//! Two implementations exist: [`local::LocalLibrary`], an in-process library, and the libwayland
//! backend of `native::sys`.

use std::{
    ffi::CStr,
    fmt,
    os::unix::io::{OwnedFd, RawFd},
    sync::Arc,
    time::Duration,
};

use crate::{
    protocol::{Argument, Interface, ProtocolError},
    types::{ListenerToken, NativeError, NativeHandle},
};

pub mod local;
#[cfg(any(feature = "server_system", feature = "client_system"))]
pub mod sys;

/// Receiver of the inbound messages of an object
pub trait NativeDispatcher: Send + Sync {
    /// Handle the message `opcode` received by `target`
    ///
    /// Returns 0 on success and -1 on failure, as native dispatchers do.
    fn dispatch(&self, target: NativeHandle, opcode: u32, args: &[Argument<'_>]) -> i32;
}

/// Callback run when the destroy signal of an object fires
pub type DestroyNotify = Box<dyn FnOnce(NativeHandle) + Send>;

/// Receiver of the binds of a global
pub trait BindHandler: Send + Sync {
    /// `client` bound `global` with `version`, the new resource must use protocol id `id`
    fn bind(&self, global: NativeHandle, client: NativeHandle, version: u32, id: u32);
}

/// Readiness of a file descriptor
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FdMask(u32);

impl FdMask {
    /// No event
    pub const NONE: Self = Self(0);
    /// The fd is readable
    pub const READABLE: Self = Self(0x01);
    /// The fd is writable
    pub const WRITABLE: Self = Self(0x02);
    /// The other end hung up
    pub const HANGUP: Self = Self(0x04);
    /// An error occured on the fd
    pub const ERROR: Self = Self(0x08);

    /// Build from the raw `WL_EVENT_*` bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0x0f)
    }

    /// The raw `WL_EVENT_*` bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bit is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FdMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FdMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl fmt::Debug for FdMask {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::HANGUP, "HANGUP"),
            (Self::ERROR, "ERROR"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// What woke an event source up
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceEvent {
    /// The file descriptor is ready
    Fd {
        /// The file descriptor
        fd: RawFd,
        /// Its readiness
        mask: FdMask,
    },
    /// The timer expired
    Timer,
    /// The signal was received
    Signal(i32),
    /// The loop is about to sleep
    Idle,
}

/// Callback of an event source
///
/// The return value is the one of the native callbacks: a source returning a positive value is
/// re-checked by `event_loop_dispatch` if it was registered for it.
pub type SourceCallback = Arc<dyn Fn(SourceEvent) -> i32 + Send + Sync>;

/// The server side native library
pub trait ServerLibrary: Send + Sync + fmt::Debug {
    /// Create a display with its event loop
    fn display_create(&self) -> Result<NativeHandle, NativeError>;
    /// Destroy a display, its clients and its globals
    fn display_destroy(&self, display: NativeHandle);
    /// The event loop of a display
    fn display_event_loop(&self, display: NativeHandle) -> NativeHandle;
    /// Listen on a socket, an automatic name is chosen if `name` is `None`
    fn display_add_socket(&self, display: NativeHandle, name: Option<&str>)
        -> Result<String, NativeError>;
    /// Make `display_run` return
    fn display_terminate(&self, display: NativeHandle);
    /// Dispatch the event loop until `display_terminate`
    fn display_run(&self, display: NativeHandle);
    /// Flush the pending events of every client
    fn display_flush_clients(&self, display: NativeHandle);
    /// The last serial
    fn display_serial(&self, display: NativeHandle) -> u32;
    /// Increment and return the serial
    fn display_next_serial(&self, display: NativeHandle) -> u32;

    /// Create a client from a connected socket
    fn client_create(&self, display: NativeHandle, fd: OwnedFd) -> Result<NativeHandle, NativeError>;
    /// Disconnect a client and destroy its resources
    fn client_destroy(&self, client: NativeHandle);
    /// Flush the pending events of a client
    fn client_flush(&self, client: NativeHandle);
    /// The display of a client
    fn client_display(&self, client: NativeHandle) -> NativeHandle;
    /// Post the "no memory" error to a client
    fn client_post_no_memory(&self, client: NativeHandle);
    /// Post an implementation error to a client
    fn client_post_error(&self, client: NativeHandle, code: u32, message: &CStr);

    /// Create a resource, a server-allocated id is used if `id` is 0
    fn resource_create(
        &self,
        client: NativeHandle,
        interface: &'static Interface,
        version: u32,
        id: u32,
    ) -> Result<NativeHandle, NativeError>;
    /// Route the requests of a resource to `dispatcher`
    fn resource_set_dispatcher(&self, resource: NativeHandle, dispatcher: Arc<dyn NativeDispatcher>);
    /// Destroy a resource, firing its destroy signal
    fn resource_destroy(&self, resource: NativeHandle);
    /// The client of a resource
    fn resource_client(&self, resource: NativeHandle) -> NativeHandle;
    /// The protocol id of a resource
    fn resource_id(&self, resource: NativeHandle) -> u32;
    /// The version of a resource
    fn resource_version(&self, resource: NativeHandle) -> u32;
    /// Send an event
    fn resource_post_event(&self, resource: NativeHandle, opcode: u32, args: &[Argument<'_>]);
    /// Post a protocol error on a resource, the client is then disconnected
    fn resource_post_error(&self, resource: NativeHandle, code: u32, message: &CStr);
    /// Post the "no memory" error on a resource
    fn resource_post_no_memory(&self, resource: NativeHandle);

    /// Subscribe to the destroy signal of a display, client, resource or event loop
    fn add_destroy_listener(
        &self,
        object: NativeHandle,
        notify: DestroyNotify,
    ) -> Result<ListenerToken, NativeError>;
    /// Unsubscribe, does nothing if the listener already fired
    fn remove_destroy_listener(&self, token: ListenerToken);

    /// Advertise a global
    fn global_create(
        &self,
        display: NativeHandle,
        interface: &'static Interface,
        version: u32,
        handler: Arc<dyn BindHandler>,
    ) -> Result<NativeHandle, NativeError>;
    /// Remove a global
    fn global_destroy(&self, global: NativeHandle);

    /// Create a standalone event loop
    fn event_loop_create(&self) -> Result<NativeHandle, NativeError>;
    /// Destroy a standalone event loop and its sources
    fn event_loop_destroy(&self, event_loop: NativeHandle);
    /// A file descriptor readable when the loop has something to dispatch
    fn event_loop_fd(&self, event_loop: NativeHandle) -> Result<RawFd, NativeError>;
    /// Watch a file descriptor
    fn event_loop_add_fd(
        &self,
        event_loop: NativeHandle,
        fd: RawFd,
        mask: FdMask,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError>;
    /// Add a timer, disarmed until updated
    fn event_loop_add_timer(
        &self,
        event_loop: NativeHandle,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError>;
    /// Watch a signal
    fn event_loop_add_signal(
        &self,
        event_loop: NativeHandle,
        signal: i32,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError>;
    /// Run `callback` once, the next time the loop is idle
    fn event_loop_add_idle(
        &self,
        event_loop: NativeHandle,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError>;
    /// Change the mask of an fd source
    fn event_source_fd_update(&self, source: NativeHandle, mask: FdMask) -> Result<(), NativeError>;
    /// Arm a timer to fire in `ms` milliseconds, 0 disarms it
    fn event_source_timer_update(&self, source: NativeHandle, ms: u32) -> Result<(), NativeError>;
    /// Remove a source
    fn event_source_remove(&self, source: NativeHandle);
    /// Ask for the source to be dispatched again after the next dispatch
    fn event_source_check(&self, source: NativeHandle);
    /// Wait at most `timeout` for events and dispatch them, `None` waits forever
    fn event_loop_dispatch(
        &self,
        event_loop: NativeHandle,
        timeout: Option<Duration>,
    ) -> Result<(), NativeError>;
    /// Run the idle sources
    fn event_loop_dispatch_idle(&self, event_loop: NativeHandle);
}

/// The client side native library
pub trait ClientLibrary: Send + Sync + fmt::Debug {
    /// Connect to the server socket `name`, or to `WAYLAND_DISPLAY` if `None`
    fn display_connect(&self, name: Option<&str>) -> Result<NativeHandle, NativeError>;
    /// Connect over an already connected socket
    fn display_connect_to_fd(&self, fd: OwnedFd) -> Result<NativeHandle, NativeError>;
    /// Close the connection and destroy its proxies
    fn display_disconnect(&self, connection: NativeHandle);
    /// Read and dispatch events, blocking until at least one is available
    fn display_dispatch(&self, connection: NativeHandle) -> Result<usize, NativeError>;
    /// Dispatch the events already read
    fn display_dispatch_pending(&self, connection: NativeHandle) -> Result<usize, NativeError>;
    /// Send the pending requests
    fn display_flush(&self, connection: NativeHandle) -> Result<(), NativeError>;
    /// Wait until the server processed every request sent so far
    fn display_roundtrip(&self, connection: NativeHandle) -> Result<usize, NativeError>;
    /// The protocol error that killed the connection, if any
    fn display_protocol_error(&self, connection: NativeHandle) -> Option<ProtocolError>;
    /// The file descriptor of the connection, readable when events arrive
    fn display_get_fd(&self, connection: NativeHandle) -> Result<RawFd, NativeError>;

    /// Create an event queue on the connection
    ///
    /// Events of a proxy go to the default queue of its connection until the proxy is moved to
    /// another queue with `proxy_set_queue`. Proxies created by a request or an event start on the
    /// queue of the proxy they come from.
    fn display_create_queue(&self, connection: NativeHandle) -> Result<NativeHandle, NativeError>;
    /// Read events and dispatch those of `queue`, blocking until at least one is available
    fn display_dispatch_queue(
        &self,
        connection: NativeHandle,
        queue: NativeHandle,
    ) -> Result<usize, NativeError>;
    /// Dispatch the events of `queue` already read
    fn display_dispatch_queue_pending(
        &self,
        connection: NativeHandle,
        queue: NativeHandle,
    ) -> Result<usize, NativeError>;
    /// Destroy an event queue, the events it still holds are dropped
    ///
    /// Must happen before the connection is closed.
    fn event_queue_destroy(&self, queue: NativeHandle);

    /// Send a request
    ///
    /// If the request creates an object, `child` gives its interface and version; the new proxy is
    /// returned and its id replaces the `NewId` placeholder of `args`.
    fn proxy_marshal(
        &self,
        proxy: NativeHandle,
        opcode: u32,
        args: &[Argument<'_>],
        child: Option<(&'static Interface, u32)>,
    ) -> Result<Option<NativeHandle>, NativeError>;
    /// Route the events of a proxy to `dispatcher`
    fn proxy_set_dispatcher(&self, proxy: NativeHandle, dispatcher: Arc<dyn NativeDispatcher>);
    /// Deliver the events of a proxy through `queue`, or the default queue if `None`
    fn proxy_set_queue(&self, proxy: NativeHandle, queue: Option<NativeHandle>);
    /// Destroy a proxy
    fn proxy_destroy(&self, proxy: NativeHandle);
    /// The protocol id of a proxy
    fn proxy_id(&self, proxy: NativeHandle) -> u32;
    /// The version of a proxy
    fn proxy_version(&self, proxy: NativeHandle) -> u32;
}
