//! Client-side peers of the native objects
//!
//! A [`Display`] is the connection to a server. It is free-standing: dropping its last reference
//! disconnects. Every [`Proxy`] created through it is owned by the connection and stays registered
//! while the native proxy can receive events, until it is destroyed or the connection is closed.
//! An [`EventQueue`] splits the events of a connection between threads.

use std::sync::Arc;

use crate::{
    debug::{self, Side},
    dispatch,
    native::{local::LocalLibrary, ClientLibrary, NativeDispatcher},
    protocol::Argument,
    registry::{ObjectRegistry, Peer},
    types::NativeHandle,
};

mod display;
mod event_queue;
mod proxy;

pub use display::Display;
pub use event_queue::EventQueue;
pub use proxy::Proxy;

/// Entry point of the client side of the bridge
#[derive(Debug)]
pub struct ClientBridge {
    library: Arc<dyn ClientLibrary>,
    registry: Arc<ObjectRegistry>,
    dispatcher: Arc<ProxyDispatcher>,
    debug: bool,
}

impl ClientBridge {
    /// Create a bridge over `library`, recording peers into `registry`
    pub fn new(library: Arc<dyn ClientLibrary>, registry: Arc<ObjectRegistry>) -> Arc<Self> {
        Arc::new(Self {
            library,
            dispatcher: Arc::new(ProxyDispatcher { registry: registry.clone() }),
            registry,
            debug: debug::has_debug_env(Side::Client),
        })
    }

    /// A bridge over the process-wide in-process library and registry
    pub fn local() -> Arc<Self> {
        Self::new(LocalLibrary::shared(), ObjectRegistry::process())
    }

    /// A bridge over `libwayland-client`, recording peers into the process-wide registry
    #[cfg(feature = "client_system")]
    pub fn system() -> Result<Arc<Self>, crate::NativeError> {
        let library = crate::native::sys::client::SystemClient::load()?;
        Ok(Self::new(Arc::new(library), ObjectRegistry::process()))
    }

    /// The native library
    pub fn library(&self) -> &Arc<dyn ClientLibrary> {
        &self.library
    }

    /// The registry peers are recorded into
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub(crate) fn dispatcher(&self) -> Arc<dyn NativeDispatcher> {
        self.dispatcher.clone()
    }

    pub(crate) fn debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn trace_send(&self, interface: &str, id: u32, name: &str, args: &[Argument<'_>]) {
        if self.debug {
            debug::print_send_message(interface, id, name, args);
        }
    }
}

#[derive(Debug)]
struct ProxyDispatcher {
    registry: Arc<ObjectRegistry>,
}

impl NativeDispatcher for ProxyDispatcher {
    fn dispatch(&self, target: NativeHandle, opcode: u32, args: &[Argument<'_>]) -> i32 {
        dispatch::dispatch_request::<Proxy>(&self.registry, target, opcode, args)
    }
}

fn as_peer<P: Peer>(peer: &Arc<P>) -> Arc<dyn Peer> {
    peer.clone()
}
