use std::{fmt, sync::Arc};

use crate::{
    dispatch::{run_guarded, RequestError},
    native::BindHandler,
    protocol::Interface,
    registry::Peer,
    types::{BridgeError, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper},
};

use super::{as_peer, Client, Display, ServerBridge};

/// Handler of the binds of a global
///
/// Failures are handled as for request handlers: a protocol error is posted to the client, other
/// failures are logged.
pub trait GlobalHandler: Send + Sync {
    /// `client` bound the global with `version`, the resource to create must use protocol id `id`
    fn bind(&self, client: &Arc<Client>, version: u32, id: u32) -> Result<(), RequestError>;
}

impl<F> GlobalHandler for F
where
    F: Fn(&Arc<Client>, u32, u32) -> Result<(), RequestError> + Send + Sync,
{
    fn bind(&self, client: &Arc<Client>, version: u32, id: u32) -> Result<(), RequestError> {
        self(client, version, id)
    }
}

struct BindTrampoline {
    bridge: Arc<ServerBridge>,
    interface: &'static Interface,
    handler: Arc<dyn GlobalHandler>,
}

impl BindHandler for BindTrampoline {
    fn bind(&self, _global: NativeHandle, client: NativeHandle, version: u32, id: u32) {
        let client = match Client::from_handle(&self.bridge, client) {
            Ok(client) => client,
            Err(err) => {
                crate::log_error!("Cannot bind {} for {}: {}", self.interface.name, client, err);
                self.bridge.library().client_post_no_memory(client);
                return;
            }
        };
        run_guarded(
            format_args!("bind of {}", self.interface.name),
            || self.handler.bind(&client, version, id),
            |code, message| client.post_error(code, message),
            || client.post_no_memory(),
        );
    }
}

/// A global advertised to the clients of a display
///
/// The display owns its globals: a global stays registered until it is destroyed, or its display
/// is.
pub struct Global {
    bridge: Arc<ServerBridge>,
    wrapper: NativeObjectWrapper,
    interface: &'static Interface,
    version: u32,
}

impl Global {
    /// Advertise `interface` at `version` on `display`
    pub fn new(
        display: &Arc<Display>,
        interface: &'static Interface,
        version: u32,
        handler: Arc<dyn GlobalHandler>,
    ) -> Result<Arc<Self>, BridgeError> {
        if version == 0 || version > interface.version {
            return Err(BridgeError::IllegalState("global version not supported by the interface"));
        }
        let bridge = display.bridge();
        let library = bridge.library();
        let display_handle = display.handle()?;
        let trampoline = Arc::new(BindTrampoline { bridge: bridge.clone(), interface, handler });
        let handle = library.global_create(display_handle, interface, version, trampoline)?;
        let global = Arc::new(Self {
            bridge: bridge.clone(),
            wrapper: NativeObjectWrapper::new(bridge.registry().clone()),
            interface,
            version,
        });
        // globals die with their display
        let attached = global.wrapper.attach_data(&as_peer(&global), handle, |_| {
            bridge.subscribe_destroy(&global, display_handle, |global| global.wrapper.destroy_notify())
        });
        let owned = attached.and_then(|()| global.wrapper.mark_owned(None));
        if let Err(err) = owned {
            global.wrapper.unsubscribe();
            global.wrapper.finalize();
            library.global_destroy(handle);
            return Err(err);
        }
        Ok(global)
    }

    /// The native global
    pub fn handle(&self) -> Result<NativeHandle, BridgeError> {
        self.wrapper.live_handle()
    }

    /// The advertised interface
    pub fn interface(&self) -> &'static Interface {
        self.interface
    }

    /// The advertised version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Stop advertising the global
    ///
    /// Destroying an already destroyed global does nothing.
    pub fn destroy(&self) {
        self.wrapper.unsubscribe();
        if let Some(handle) = self.wrapper.begin_destroy() {
            self.bridge.library().global_destroy(handle);
        }
        self.wrapper.finalize();
    }

    /// Lifecycle state of the global
    pub fn state(&self) -> LifecycleState {
        self.wrapper.state()
    }
}

impl Peer for Global {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }
}

impl Drop for Global {
    fn drop(&mut self) {
        let library = self.bridge.library().clone();
        self.wrapper.release(|handle| library.global_destroy(handle));
    }
}

impl fmt::Debug for Global {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Global")
            .field("interface", &self.interface.name)
            .field("version", &self.version)
            .field("wrapper", &self.wrapper)
            .finish_non_exhaustive()
    }
}
