// This module contains helpers functions and types that
// are not test in themselves, but are used by several tests.

#![allow(dead_code)]

pub extern crate wayland_bridge as bridge;

use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustix::event::{PollFd, PollFlags, Timespec};

use bridge::client::{self, ClientBridge, Proxy};
use bridge::core_interfaces::{WL_CALLBACK_INTERFACE, WL_REGISTRY_BIND, WL_REGISTRY_INTERFACE};
use bridge::dispatch::{Implementation, RequestError, Value};
use bridge::native::{local::LocalLibrary, ClientLibrary, ServerLibrary};
use bridge::protocol::{AllowNull, ArgumentType, Interface, MessageDesc, ProtocolError};
use bridge::registry::ObjectRegistry;
use bridge::server::{self, Global, GlobalHandler, Resource, ServerBridge};
use bridge::{BridgeError, NativeError};

/// Define the test `$name` once per native library, as `$name::local` and, with the
/// `server_system` and `client_system` features, `$name::system`
///
/// The body sees the [`TestServer`] as `$server`.
#[allow(unused_macros)]
macro_rules! backend_test {
    ($name:ident, |$server:ident| $body:block) => {
        mod $name {
            #[allow(unused_imports)]
            use super::*;

            #[test]
            fn local() {
                let $server = TestServer::new();
                $body
            }

            #[cfg(all(feature = "server_system", feature = "client_system"))]
            #[test]
            fn system() {
                let $server = TestServer::system();
                $body
            }
        }
    };
}

pub const COMPOSITOR_CREATE_SURFACE: u32 = 0;
pub const COMPOSITOR_PING: u32 = 1;
pub const COMPOSITOR_ATTACH: u32 = 2;
pub const COMPOSITOR_RELEASE: u32 = 3;

pub const COMPOSITOR_PONG: u32 = 0;
pub const COMPOSITOR_CONFIGURED: u32 = 1;

pub const SURFACE_DESTROY: u32 = 0;
pub const SURFACE_ENTER: u32 = 0;

pub static COMPOSITOR_INTERFACE: Interface = Interface {
    name: "test_compositor",
    version: 2,
    requests: &[
        MessageDesc {
            name: "create_surface",
            signature: &[ArgumentType::NewId],
            since: 1,
            is_destructor: false,
            child_interface: Some(&SURFACE_INTERFACE),
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "ping",
            signature: &[ArgumentType::Uint, ArgumentType::Str(AllowNull::Yes)],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "attach",
            signature: &[ArgumentType::Object(AllowNull::No)],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[&SURFACE_INTERFACE],
        },
        MessageDesc {
            name: "release",
            signature: &[],
            since: 2,
            is_destructor: true,
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
    events: &[
        MessageDesc {
            name: "pong",
            signature: &[ArgumentType::Uint],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "configured",
            signature: &[],
            since: 2,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
};

pub static SURFACE_INTERFACE: Interface = Interface {
    name: "test_surface",
    version: 1,
    requests: &[MessageDesc {
        name: "destroy",
        signature: &[],
        since: 1,
        is_destructor: true,
        child_interface: None,
        arg_interfaces: &[],
    }],
    events: &[MessageDesc {
        name: "enter",
        signature: &[ArgumentType::Int],
        since: 1,
        is_destructor: false,
        child_interface: None,
        arg_interfaces: &[],
    }],
};

pub type Resources = Arc<Mutex<Vec<Arc<Resource>>>>;

/// Globals announced to a client registry, as `(name, interface, version)`
pub type Globals = Arc<Mutex<Vec<(u32, String, u32)>>>;

pub struct TestServer {
    pub library: Arc<dyn ServerLibrary>,
    pub bridge: Arc<ServerBridge>,
    pub display: Arc<server::Display>,
    /// The library clients of this server connect with
    pub client_library: Arc<dyn ClientLibrary>,
    /// Name clients of the in-process library connect to
    pub socket: Option<String>,
    local: Option<Arc<LocalLibrary>>,
}

impl TestServer {
    /// A server over a private in-process library
    pub fn new() -> TestServer {
        let library = Arc::new(LocalLibrary::new());
        let mut server = TestServer::with_libraries(library.clone(), library.clone());
        server.socket = Some(server.display.add_socket_auto().unwrap());
        server.local = Some(library);
        server
    }

    /// A server over `libwayland-server`, its clients use `libwayland-client`
    #[cfg(all(feature = "server_system", feature = "client_system"))]
    pub fn system() -> TestServer {
        use bridge::native::sys::{client::SystemClient, server::SystemServer};
        let server = SystemServer::load().expect("libwayland-server is not available");
        let client = SystemClient::load().expect("libwayland-client is not available");
        TestServer::with_libraries(Arc::new(server), Arc::new(client))
    }

    /// A server over `library`, clients connect to it over socket pairs
    pub fn with_libraries(library: Arc<dyn ServerLibrary>, client_library: Arc<dyn ClientLibrary>) -> TestServer {
        let _ = env_logger::builder().is_test(true).try_init();
        let bridge = ServerBridge::new(library.clone(), Arc::new(ObjectRegistry::new()));
        let display = server::Display::create(&bridge).unwrap();
        TestServer { library, bridge, display, client_library, socket: None, local: None }
    }

    /// The in-process library, for the checks only it can answer
    pub fn local(&self) -> &LocalLibrary {
        self.local.as_deref().expect("not an in-process server")
    }

    pub fn answer(&self) {
        self.display.dispatch(Some(Duration::ZERO)).unwrap();
        self.display.flush_clients();
    }

    /// Advertise the test compositor, every bound resource is stored in `resources`
    pub fn create_compositor(
        &self,
        version: u32,
        implementation: Arc<Implementation<Resource>>,
        resources: Resources,
    ) -> Arc<Global> {
        let handler: Arc<dyn GlobalHandler> = Arc::new(
            move |client: &Arc<server::Client>, version: u32, id: u32| -> Result<(), RequestError> {
                let resource =
                    Resource::new(client, &COMPOSITOR_INTERFACE, version, id, implementation.clone())?;
                client.add_resource(&resource)?;
                resources.lock().unwrap().push(resource);
                Ok(())
            },
        );
        Global::new(&self.display, &COMPOSITOR_INTERFACE, version, handler).unwrap()
    }

    pub fn add_client(&self) -> TestClient {
        match &self.socket {
            Some(socket) => TestClient::connect(self.client_library.clone(), socket),
            None => self.add_socket_client().1,
        }
    }

    /// Connect a client over a socket pair, the server end becoming a client of the display
    pub fn add_socket_client(&self) -> (Arc<server::Client>, TestClient) {
        let (server_socket, client_socket) = UnixStream::pair().unwrap();
        let client = self.display.create_client(OwnedFd::from(server_socket)).unwrap();
        let test_client = TestClient::connect_to_fd(self.client_library.clone(), OwnedFd::from(client_socket));
        (client, test_client)
    }
}

pub struct TestClient {
    pub bridge: Arc<ClientBridge>,
    pub display: Arc<client::Display>,
    pub registry: Arc<Proxy>,
    pub globals: Globals,
}

impl TestClient {
    pub fn connect(library: Arc<dyn ClientLibrary>, socket: &str) -> TestClient {
        let bridge = ClientBridge::new(library, Arc::new(ObjectRegistry::new()));
        let display = client::Display::connect(&bridge, Some(socket)).unwrap();
        TestClient::new(bridge, display)
    }

    pub fn connect_to_fd(library: Arc<dyn ClientLibrary>, fd: OwnedFd) -> TestClient {
        let bridge = ClientBridge::new(library, Arc::new(ObjectRegistry::new()));
        let display = client::Display::connect_to_fd(&bridge, fd).expect("Failed to connect to server.");
        TestClient::new(bridge, display)
    }

    fn new(bridge: Arc<ClientBridge>, display: Arc<client::Display>) -> TestClient {
        let globals = Globals::default();
        let added = globals.clone();
        let removed = globals.clone();
        let implementation = Implementation::<Proxy>::builder(&WL_REGISTRY_INTERFACE)
            .on("global", move |_, values| {
                let entry = (
                    values[0].as_uint().unwrap(),
                    values[1].as_str().unwrap().to_owned(),
                    values[2].as_uint().unwrap(),
                );
                added.lock().unwrap().push(entry);
                Ok(())
            })
            .on("global_remove", move |_, values| {
                let name = values[0].as_uint().unwrap();
                removed.lock().unwrap().retain(|(n, _, _)| *n != name);
                Ok(())
            })
            .build()
            .unwrap();
        let registry = display.get_registry(implementation).unwrap();
        TestClient { bridge, display, registry, globals }
    }

    pub fn global_name(&self, interface: &str) -> Option<u32> {
        self.globals
            .lock()
            .unwrap()
            .iter()
            .find(|(_, i, _)| i == interface)
            .map(|(name, _, _)| *name)
    }

    pub fn bind(
        &self,
        name: u32,
        interface: &'static Interface,
        version: u32,
        implementation: Arc<Implementation<Proxy>>,
    ) -> Result<Arc<Proxy>, BridgeError> {
        self.registry.marshal_constructor(
            WL_REGISTRY_BIND,
            &[
                Value::Uint(name),
                Value::Str(Some(interface.name.into())),
                Value::Uint(version),
                Value::NewId(0),
            ],
            interface,
            version,
            implementation,
        )
    }

    /// Bind the test compositor announced by the last roundtrip
    pub fn bind_compositor(&self, version: u32, implementation: Arc<Implementation<Proxy>>) -> Arc<Proxy> {
        let name = self.global_name(COMPOSITOR_INTERFACE.name).expect("compositor not announced");
        self.bind(name, &COMPOSITOR_INTERFACE, version, implementation).unwrap()
    }

    /// Dispatch what the server sent, waiting for it at most `timeout`
    pub fn dispatch_incoming(&self, timeout: Duration) -> Result<usize, BridgeError> {
        let fd = match self.display.fd() {
            Ok(fd) => fd,
            // nothing to read from, received events are already queued
            Err(BridgeError::Native(NativeError::Unsupported(_))) => return self.display.dispatch_pending(),
            Err(err) => return Err(err),
        };
        // SAFETY: the connection owns the fd and outlives this call
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut poll_fds = [PollFd::new(&fd, PollFlags::IN)];
        let timeout = Timespec { tv_sec: timeout.as_secs() as _, tv_nsec: timeout.subsec_nanos() as _ };
        let ready = rustix::event::poll(&mut poll_fds, Some(&timeout)).unwrap_or(0);
        if ready > 0 {
            self.display.dispatch()
        } else {
            self.display.dispatch_pending()
        }
    }
}

/// Exchange messages until the server processed everything the client sent so far
///
/// The in-process library runs the server side of a roundtrip itself. Over libwayland, the client
/// sends `wl_display.sync` and both sides are driven from this thread until the callback is done.
pub fn roundtrip(client: &TestClient, server: &TestServer) -> Result<(), BridgeError> {
    server.display.flush_clients();
    if server.local.is_some() {
        client.display.roundtrip()?;
        return Ok(());
    }
    let done = Arc::new(AtomicBool::new(false));
    let seen = done.clone();
    let implementation = Implementation::<Proxy>::builder(&WL_CALLBACK_INTERFACE)
        .on("done", move |_, _| {
            seen.store(true, Ordering::Release);
            Ok(())
        })
        .build()
        .unwrap();
    let _callback = client.display.sync(implementation)?;
    while !done.load(Ordering::Acquire) {
        match client.display.flush() {
            Ok(()) => {}
            Err(BridgeError::Native(NativeError::Io(e))) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
        }
        // make it answer messages
        server.answer();
        client.dispatch_incoming(Duration::from_millis(100))?;
    }
    Ok(())
}

/// Extract the protocol error a client connection died of
pub fn protocol_error(err: BridgeError) -> ProtocolError {
    match err {
        BridgeError::Native(NativeError::Protocol(err)) => err,
        other => panic!("expected a protocol error, got {other:?}"),
    }
}

pub fn empty_client(interface: &'static Interface) -> Arc<Implementation<Proxy>> {
    Implementation::empty(interface)
}

pub fn empty_server(interface: &'static Interface) -> Arc<Implementation<Resource>> {
    Implementation::empty(interface)
}
