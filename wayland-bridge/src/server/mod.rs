//! Server-side peers of the native objects
//!
//! Every peer type of this module is created from a [`ServerBridge`], which bundles the native
//! library and the registry the peers are recorded into. Peers follow the lifetime rules of the
//! bridge:
//!
//! - a [`Display`] or a standalone [`EventLoop`] is free-standing: it lives as long as Rust code
//!   references it, and dropping its last [`Arc`] destroys the native object;
//! - a [`Client`], a [`Global`] or a registered [`EventSource`] is owned by its native parent and
//!   kept alive by the registry until it is destroyed;
//! - a [`Resource`] is free-standing until [`Client::add_resource`] hands it over to its client.
//!
//! Whichever comes first of an explicit `destroy()`, the destroy signal of the native object or the
//! drop of its last reference, the peer is finalized exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    debug::{self, Side},
    dispatch,
    native::{local::LocalLibrary, NativeDispatcher, ServerLibrary},
    protocol::Argument,
    registry::{ObjectRegistry, Peer},
    types::{BridgeError, NativeHandle},
    wrapper::Subscription,
};

mod client;
mod display;
mod event_loop;
mod global;
mod listener;
mod resource;

pub use client::Client;
pub use display::Display;
pub use event_loop::{EventLoop, EventSource};
pub use global::{Global, GlobalHandler};
pub use listener::DestroyListener;
pub use resource::Resource;

/// Entry point of the server side of the bridge
#[derive(Debug)]
pub struct ServerBridge {
    library: Arc<dyn ServerLibrary>,
    registry: Arc<ObjectRegistry>,
    dispatcher: Arc<PeerDispatcher>,
    client_creation: Mutex<()>,
    debug: bool,
}

impl ServerBridge {
    /// Create a bridge over `library`, recording peers into `registry`
    pub fn new(library: Arc<dyn ServerLibrary>, registry: Arc<ObjectRegistry>) -> Arc<Self> {
        Arc::new(Self {
            library,
            dispatcher: Arc::new(PeerDispatcher { registry: registry.clone() }),
            registry,
            client_creation: Mutex::new(()),
            debug: debug::has_debug_env(Side::Server),
        })
    }

    /// A bridge over the process-wide in-process library and registry
    pub fn local() -> Arc<Self> {
        Self::new(LocalLibrary::shared(), ObjectRegistry::process())
    }

    /// A bridge over `libwayland-server`, recording peers into the process-wide registry
    #[cfg(feature = "server_system")]
    pub fn system() -> Result<Arc<Self>, crate::NativeError> {
        let library = crate::native::sys::server::SystemServer::load()?;
        Ok(Self::new(Arc::new(library), ObjectRegistry::process()))
    }

    /// The native library
    pub fn library(&self) -> &Arc<dyn ServerLibrary> {
        &self.library
    }

    /// The registry peers are recorded into
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Subscribe to the destroy signal of `object` on behalf of `peer`
    ///
    /// The listener only keeps a weak reference to the peer.
    pub(crate) fn subscribe_destroy<P, F>(
        &self,
        peer: &Arc<P>,
        object: NativeHandle,
        notify: F,
    ) -> Result<Option<Subscription>, BridgeError>
    where
        P: Peer,
        F: FnOnce(&P) + Send + 'static,
    {
        let weak = Arc::downgrade(peer);
        let token = self.library.add_destroy_listener(
            object,
            Box::new(move |_| {
                if let Some(peer) = weak.upgrade() {
                    notify(&peer);
                }
            }),
        )?;
        let library = self.library.clone();
        Ok(Some(Subscription::new(token, move |token| library.remove_destroy_listener(token))))
    }

    /// Taken while a client peer is created, before any wrapper or registry lock
    pub(crate) fn lock_client_creation(&self) -> MutexGuard<'_, ()> {
        self.client_creation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn dispatcher(&self) -> Arc<dyn NativeDispatcher> {
        self.dispatcher.clone()
    }

    pub(crate) fn debug(&self) -> bool {
        self.debug
    }

    /// Print a message sent to a client when `WAYLAND_DEBUG` asks for it
    pub(crate) fn trace_send(&self, interface: &str, id: u32, name: &str, args: &[Argument<'_>]) {
        if self.debug {
            debug::print_send_message(interface, id, name, args);
        }
    }
}

/// Routes the requests of every resource of a bridge to their peer
#[derive(Debug)]
struct PeerDispatcher {
    registry: Arc<ObjectRegistry>,
}

impl NativeDispatcher for PeerDispatcher {
    fn dispatch(&self, target: NativeHandle, opcode: u32, args: &[Argument<'_>]) -> i32 {
        dispatch::dispatch_request::<Resource>(&self.registry, target, opcode, args)
    }
}

fn as_peer<P: Peer>(peer: &Arc<P>) -> Arc<dyn Peer> {
    peer.clone()
}
