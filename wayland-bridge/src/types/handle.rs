use std::fmt;

/// The kind of native object a [`NativeHandle`] points to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// A server-side `wl_display`
    Display,
    /// A server-side `wl_client`
    Client,
    /// A server-side `wl_resource`
    Resource,
    /// A server-side `wl_global`
    Global,
    /// A `wl_event_loop`
    EventLoop,
    /// A `wl_event_source`
    EventSource,
    /// A client-side connection (the `wl_display` of libwayland-client)
    Connection,
    /// A client-side `wl_proxy`
    Proxy,
    /// A client-side `wl_event_queue`
    EventQueue,
}

impl HandleKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::Client => "client",
            Self::Resource => "resource",
            Self::Global => "global",
            Self::EventLoop => "event_loop",
            Self::EventSource => "event_source",
            Self::Connection => "connection",
            Self::Proxy => "proxy",
            Self::EventQueue => "event_queue",
        }
    }
}

/// An opaque handle to an object owned by the native library
///
/// The handle is only an identity: the bridge never reads or frees the memory it points to, the
/// native library does. Two handles are equal if and only if they designate the same native object
/// (same kind, same address), which makes them suitable as keys of the
/// [`ObjectRegistry`](crate::registry::ObjectRegistry).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    kind: HandleKind,
    addr: usize,
}

impl NativeHandle {
    /// Wrap a native pointer, returns `None` if it is null
    pub fn from_ptr<T>(kind: HandleKind, ptr: *mut T) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self { kind, addr: ptr as usize })
        }
    }

    /// Build a handle from a raw address, used by native libraries that do not hand out pointers
    ///
    /// Returns `None` if the address is 0.
    pub fn from_addr(kind: HandleKind, addr: usize) -> Option<Self> {
        if addr == 0 {
            None
        } else {
            Some(Self { kind, addr })
        }
    }

    pub(crate) const fn from_raw_parts(kind: HandleKind, addr: usize) -> Self {
        Self { kind, addr }
    }

    /// The kind of object this handle designates
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// The address of the native object
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// The native pointer
    pub fn as_ptr<T>(&self) -> *mut T {
        self.addr as *mut T
    }

    /// The same native object seen as another kind
    ///
    /// libwayland-client lays out a `wl_display` as a `wl_proxy`, which makes the connection object
    /// usable as the proxy of the `wl_display` protocol object.
    pub fn with_kind(self, kind: HandleKind) -> Self {
        Self { kind, addr: self.addr }
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.kind.as_str(), self.addr)
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A subscription to the destroy signal of a native object
///
/// Returned by the native library when a destroy listener is added, it identifies the listener for
/// later removal. Removing a listener that already fired is a no-op.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    object: NativeHandle,
    id: usize,
}

impl ListenerToken {
    /// Create a token for the listener `id` of `object`
    pub fn new(object: NativeHandle, id: usize) -> Self {
        Self { object, id }
    }

    /// The object whose destroy signal is listened to
    pub fn object(&self) -> NativeHandle {
        self.object
    }

    /// The library-specific identifier of the listener
    pub fn id(&self) -> usize {
        self.id
    }
}
