//! In-process implementation of the native library
//!
//! [`LocalLibrary`] implements both [`ServerLibrary`](super::ServerLibrary) and
//! [`ClientLibrary`](super::ClientLibrary) in memory, with the object semantics of libwayland:
//! destroy signals fire before an object is forgotten, protocol ids are allocated the same way,
//! `wl_display`, `wl_registry` and `wl_callback` are handled by the library itself.
//!
//! A client connects to a display through the name given to `display_add_socket`, without any real
//! socket: requests are queued to the server side client and processed when the event loop of its
//! display is dispatched, events are queued to the connection, sorted to the event queue of their
//! target and delivered by `display_dispatch_queue_pending`. File descriptors crossing a connection are duplicated, and the
//! handler receiving one owns it.
//!
//! All state is behind a single mutex, released before any callback runs.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    ffi::CString,
    fmt,
    os::unix::io::OwnedFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    time::Instant,
};

use crate::{
    protocol::{Interface, ProtocolError},
    types::{HandleKind, NativeError, NativeHandle},
};

use super::{BindHandler, DestroyNotify, FdMask, NativeDispatcher, SourceCallback};

mod client;
mod event_loop;
pub(crate) mod map;
mod server;

use map::IdMap;

/// An argument travelling through an in-process connection
#[derive(Debug)]
enum WireArg {
    Int(i32),
    Uint(u32),
    Fixed(i32),
    Str(Option<CString>),
    /// Protocol id, 0 for null
    Object(u32),
    NewId(u32),
    Array(Vec<u8>),
    Fd(OwnedFd),
}

#[derive(Debug)]
struct WireMessage {
    sender_id: u32,
    opcode: u32,
    args: Vec<WireArg>,
}

/// A protocol error posted to a server side client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostedError {
    /// Protocol id of the object the error was posted on
    pub object_id: u32,
    /// Error code
    pub code: u32,
    /// Error message
    pub message: String,
}

struct DisplayData {
    event_loop: usize,
    clients: Vec<usize>,
    globals: Vec<usize>,
    sockets: Vec<String>,
    serial: u32,
    next_global_name: u32,
    terminated: bool,
}

struct ClientData {
    display: usize,
    objects: IdMap<usize>,
    requests: VecDeque<WireMessage>,
    connection: Option<usize>,
    errored: bool,
    destroying: bool,
    _socket: Option<OwnedFd>,
}

enum ResourceKind {
    Managed(Option<Arc<dyn NativeDispatcher>>),
    Display,
    Registry,
    Callback,
}

struct ResourceData {
    client: usize,
    id: u32,
    interface: &'static Interface,
    version: u32,
    kind: ResourceKind,
}

struct GlobalData {
    display: usize,
    name: u32,
    interface: &'static Interface,
    version: u32,
    handler: Arc<dyn BindHandler>,
}

struct LoopData {
    display: Option<usize>,
    sources: Vec<usize>,
}

enum SourceKind {
    Fd { fd: std::os::unix::io::RawFd, mask: FdMask },
    Timer { deadline: Option<Instant> },
    Idle,
}

struct SourceData {
    event_loop: usize,
    callback: SourceCallback,
    kind: SourceKind,
    check: bool,
}

enum ProxySlot {
    Live(usize),
    /// Destroyed on the client, waiting for the server to release the id
    Zombie,
}

/// An event sorted to the queue of its target
struct QueuedEvent {
    sender: usize,
    message: WireMessage,
}

struct ConnectionData {
    objects: IdMap<ProxySlot>,
    /// Sent by the server, not sorted to a queue yet
    events: VecDeque<WireMessage>,
    /// The default queue
    queued: VecDeque<QueuedEvent>,
    queues: HashMap<usize, VecDeque<QueuedEvent>>,
    server_client: Option<usize>,
    error: Option<ProtocolError>,
}

struct ProxyData {
    connection: usize,
    id: u32,
    interface: &'static Interface,
    version: u32,
    dispatcher: Option<Arc<dyn NativeDispatcher>>,
    /// `None` for the default queue
    queue: Option<usize>,
}

#[derive(Default)]
struct State {
    displays: HashMap<usize, DisplayData>,
    clients: HashMap<usize, ClientData>,
    resources: HashMap<usize, ResourceData>,
    globals: HashMap<usize, GlobalData>,
    loops: HashMap<usize, LoopData>,
    sources: HashMap<usize, SourceData>,
    listeners: BTreeMap<usize, (NativeHandle, DestroyNotify)>,
    next_listener: usize,
    sockets: HashMap<String, usize>,
    connections: HashMap<usize, ConnectionData>,
    proxies: HashMap<usize, ProxyData>,
    /// Event queue to its connection
    event_queues: HashMap<usize, usize>,
    posted_errors: HashMap<usize, PostedError>,
}

impl State {
    fn is_alive(&self, handle: NativeHandle) -> bool {
        let addr = handle.addr();
        match handle.kind() {
            HandleKind::Display => self.displays.contains_key(&addr),
            HandleKind::Client => self.clients.contains_key(&addr),
            HandleKind::Resource => self.resources.contains_key(&addr),
            HandleKind::Global => self.globals.contains_key(&addr),
            HandleKind::EventLoop => self.loops.contains_key(&addr),
            HandleKind::EventSource => self.sources.contains_key(&addr),
            HandleKind::Connection => self.connections.contains_key(&addr),
            HandleKind::Proxy => self.proxies.contains_key(&addr),
            HandleKind::EventQueue => self.event_queues.contains_key(&addr),
        }
    }
}

/// The in-process native library
pub struct LocalLibrary {
    state: Mutex<State>,
    next_addr: AtomicUsize,
}

impl LocalLibrary {
    /// Create an empty library
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), next_addr: AtomicUsize::new(0x1000) }
    }

    /// The library shared by the whole process
    ///
    /// Server and client bridges must share a library for clients to reach the server.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<LocalLibrary>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::new())).clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Addresses are never reused
    fn alloc(&self, kind: HandleKind) -> NativeHandle {
        handle(kind, self.next_addr.fetch_add(0x10, Ordering::Relaxed))
    }

    /// Whether the native object still exists
    pub fn is_alive(&self, handle: NativeHandle) -> bool {
        self.lock().is_alive(handle)
    }

    /// The protocol error posted to a server side client, if any
    ///
    /// The error is remembered after the client is destroyed.
    pub fn client_protocol_error(&self, client: NativeHandle) -> Option<PostedError> {
        self.lock().posted_errors.get(&client.addr()).cloned()
    }

    /// The clients of a display
    pub fn display_clients(&self, display: NativeHandle) -> Vec<NativeHandle> {
        let state = self.lock();
        state
            .displays
            .get(&display.addr())
            .map(|d| {
                d.clients
                    .iter()
                    .map(|&addr| handle(HandleKind::Client, addr))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn add_listener(
        &self,
        object: NativeHandle,
        notify: DestroyNotify,
    ) -> Result<crate::ListenerToken, NativeError> {
        let mut state = self.lock();
        let listenable = matches!(
            object.kind(),
            HandleKind::Display | HandleKind::Client | HandleKind::Resource | HandleKind::EventLoop
        );
        if !listenable || !state.is_alive(object) {
            drop(state);
            drop(notify);
            return Err(NativeError::InvalidObject);
        }
        state.next_listener += 1;
        let id = state.next_listener;
        state.listeners.insert(id, (object, notify));
        Ok(crate::ListenerToken::new(object, id))
    }

    fn remove_listener(&self, token: crate::ListenerToken) {
        let removed = {
            let mut state = self.lock();
            match state.listeners.get(&token.id()) {
                Some((object, _)) if *object == token.object() => state.listeners.remove(&token.id()),
                _ => None,
            }
        };
        drop(removed);
    }

    /// Fire the destroy signal of `object`, in subscription order
    fn emit_destroy(&self, object: NativeHandle) {
        loop {
            let next = {
                let mut state = self.lock();
                let id = state
                    .listeners
                    .iter()
                    .find(|(_, (target, _))| *target == object)
                    .map(|(id, _)| *id);
                id.and_then(|id| state.listeners.remove(&id))
            };
            match next {
                Some((_, notify)) => notify(object),
                None => break,
            }
        }
    }
}

impl Default for LocalLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalLibrary {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("LocalLibrary")
            .field("displays", &state.displays.len())
            .field("clients", &state.clients.len())
            .field("resources", &state.resources.len())
            .field("connections", &state.connections.len())
            .field("proxies", &state.proxies.len())
            .finish_non_exhaustive()
    }
}

fn handle(kind: HandleKind, addr: usize) -> NativeHandle {
    NativeHandle::from_raw_parts(kind, addr)
}

fn dup_fd(fd: std::os::unix::io::RawFd) -> Result<OwnedFd, NativeError> {
    // SAFETY: the sender guarantees the fd is open for the duration of the call
    let borrowed = unsafe { std::os::unix::io::BorrowedFd::borrow_raw(fd) };
    Ok(rustix::io::dup(borrowed)?)
}
