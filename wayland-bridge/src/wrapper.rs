//! Per-peer bookkeeping of the native object
//!
//! A [`NativeObjectWrapper`] is embedded in every peer. It holds the native handle, the
//! subscription to the destroy signal of the native object and the ownership state, and drives the
//! registry entry through the lifetime transitions:
//!
//! ```text
//!   Unbound --mark_owned--> Attached --mark_disowned(false)--> Detached
//!      |                       |                                  |
//!      +-------- destroy(), destroy signal, last Arc dropped -----+--> Destroyed
//! ```
//!
//! Finalization (clearing the handle and removing the registry entry) happens at most once,
//! whichever trigger comes first. The wrapper lock is always taken before the registry lock, and
//! neither is held while a callback runs or a peer reference is dropped.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use crate::{
    registry::{ObjectRegistry, Peer, PeerRef, ReferenceMode},
    types::{BridgeError, ListenerToken, NativeHandle},
};

/// Lifecycle of a peer with respect to its native object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// No native object yet, or one that was never attached to a native parent
    Unbound,
    /// Owned by a native parent, the registry keeps the peer alive
    Attached,
    /// Released by its native parent, the peer lives only while referenced
    Detached,
    /// The native object is gone
    Destroyed,
}

/// A subscription to the destroy signal of a native object
///
/// Dropping it does not unsubscribe: once the signal fired, the native library releases the
/// listener by itself. Use [`Subscription::cancel`] to unsubscribe from a live object.
pub struct Subscription {
    token: ListenerToken,
    cancel: Box<dyn FnOnce(ListenerToken) + Send>,
}

impl Subscription {
    /// Create a subscription, `cancel` removes the listener from the native object
    pub fn new(token: ListenerToken, cancel: impl FnOnce(ListenerToken) + Send + 'static) -> Self {
        Self { token, cancel: Box::new(cancel) }
    }

    /// The token of the native listener
    pub fn token(&self) -> ListenerToken {
        self.token
    }

    /// Remove the listener from the native object
    pub fn cancel(self) {
        (self.cancel)(self.token)
    }
}

impl fmt::Debug for Subscription {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("token", &self.token).finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct WrapperState {
    handle: Option<NativeHandle>,
    subscription: Option<Subscription>,
    self_ref: Option<Weak<dyn Peer>>,
    owned: bool,
    was_owned: bool,
    destroyed_by_owner: bool,
    destroying: bool,
    finalized: bool,
}

impl WrapperState {
    /// Clear the handle and hand back the registry entry, to be dropped once unlocked
    fn finalize(&mut self, registry: &ObjectRegistry) -> (Option<PeerRef>, Option<Subscription>) {
        self.finalized = true;
        self.owned = false;
        let subscription = self.subscription.take();
        let entry = match (self.handle.take(), self.self_ref.take()) {
            (Some(handle), Some(peer)) => registry.take_peer(handle, &peer),
            (Some(handle), None) => registry.take(handle),
            (None, _) => None,
        };
        (entry, subscription)
    }
}

/// Native object bookkeeping embedded in a peer
pub struct NativeObjectWrapper {
    registry: Arc<ObjectRegistry>,
    state: Mutex<WrapperState>,
}

impl NativeObjectWrapper {
    /// Create an unbound wrapper whose entries go to `registry`
    pub fn new(registry: Arc<ObjectRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(WrapperState {
                handle: None,
                subscription: None,
                self_ref: None,
                owned: false,
                was_owned: false,
                destroyed_by_owner: true,
                destroying: false,
                finalized: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WrapperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The registry this wrapper registers into
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Associate the wrapper with its native object
    ///
    /// The peer is registered weakly, then `subscribe` subscribes to the destroy signal of the
    /// native object. If subscribing fails the registration is rolled back. Fails with
    /// [`BridgeError::AlreadyAssigned`] if the wrapper already had a native object.
    pub fn attach_data<F>(
        &self,
        peer: &Arc<dyn Peer>,
        handle: NativeHandle,
        subscribe: F,
    ) -> Result<(), BridgeError>
    where
        F: FnOnce(NativeHandle) -> Result<Option<Subscription>, BridgeError>,
    {
        {
            let mut state = self.lock();
            if state.handle.is_some() || state.finalized {
                return Err(BridgeError::AlreadyAssigned);
            }
            self.registry.register(handle, peer, ReferenceMode::Weak)?;
            state.handle = Some(handle);
            state.self_ref = Some(Arc::downgrade(peer));
        }

        match subscribe(handle) {
            Ok(subscription) => {
                self.lock().subscription = subscription;
                Ok(())
            }
            Err(err) => {
                let entry = {
                    let mut state = self.lock();
                    state.handle = None;
                    state.self_ref.take().and_then(|peer| self.registry.take_peer(handle, &peer))
                };
                drop(entry);
                Err(err)
            }
        }
    }

    /// Make the registry keep the peer alive
    ///
    /// `explicit` is used as the strong reference when given, otherwise one is created from the
    /// weak self-reference.
    pub fn mark_owned(&self, explicit: Option<Arc<dyn Peer>>) -> Result<(), BridgeError> {
        let old = {
            let mut state = self.lock();
            let handle = state.handle.ok_or(BridgeError::IllegalState("null object cannot be owned"))?;
            if state.owned {
                return Err(BridgeError::IllegalState("object already owned"));
            }
            let strong = match explicit {
                Some(peer) => peer,
                None => state
                    .self_ref
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .ok_or(BridgeError::IllegalState("object is being released"))?,
            };
            let old = self.registry.promote_entry(handle, strong)?;
            state.owned = true;
            state.was_owned = true;
            old
        };
        drop(old);
        Ok(())
    }

    /// Release the ownership of the native parent
    ///
    /// The destroy signal subscription is cancelled. With `destroy_now` the wrapper is finalized,
    /// the native object being already gone; otherwise the peer falls back to weak reachability.
    /// Disowning a finalized wrapper does nothing.
    pub fn mark_disowned(&self, destroy_now: bool) -> Result<(), BridgeError> {
        let (entry, subscription) = {
            let mut state = self.lock();
            if state.finalized {
                return Ok(());
            }
            let handle =
                state.handle.ok_or(BridgeError::IllegalState("null object cannot be disowned"))?;
            if !state.owned && !destroy_now {
                return Err(BridgeError::IllegalState("object already disowned"));
            }
            if destroy_now {
                state.finalize(&self.registry)
            } else {
                state.owned = false;
                (self.registry.downgrade(handle), state.subscription.take())
            }
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        drop(entry);
        Ok(())
    }

    /// Handle the destroy signal of the native object
    ///
    /// If the destruction was not initiated through the bridge, the wrapper is finalized now.
    /// Otherwise the peer is only demoted, the initiator finalizes once the native call returns.
    pub fn destroy_notify(&self) {
        let (entry, subscription) = {
            let mut state = self.lock();
            if state.finalized {
                return;
            }
            let Some(handle) = state.handle else {
                crate::log_warn!("destroy signal received by a wrapper without native object");
                return;
            };
            if state.destroyed_by_owner {
                state.finalize(&self.registry)
            } else if state.owned {
                state.owned = false;
                (self.registry.downgrade(handle), state.subscription.take())
            } else {
                (None, state.subscription.take())
            }
        };
        // the listener is being released by the native library
        drop(subscription);
        drop(entry);
    }

    /// Start a destruction initiated through the bridge
    ///
    /// Returns the handle to pass to the native destroy function, or `None` if the object is
    /// already destroyed or being destroyed.
    pub fn begin_destroy(&self) -> Option<NativeHandle> {
        let mut state = self.lock();
        if state.finalized || state.destroying {
            return None;
        }
        let handle = state.handle?;
        state.destroying = true;
        state.destroyed_by_owner = false;
        Some(handle)
    }

    /// Finalize the wrapper, does nothing if already finalized
    pub fn finalize(&self) {
        let (entry, subscription) = {
            let mut state = self.lock();
            if state.finalized {
                return;
            }
            state.finalize(&self.registry)
        };
        drop(subscription);
        drop(entry);
    }

    /// Destroy a native object whose last peer reference is being dropped
    ///
    /// Meant for `Drop` implementations: if the native parent still owns the object, only the
    /// subscription is cancelled and the parent remains in charge of the native object.
    pub fn release<F: FnOnce(NativeHandle)>(&self, destroy: F) {
        let (owned, subscription) = {
            let mut state = self.lock();
            if state.finalized {
                return;
            }
            (state.owned, state.subscription.take())
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        if owned {
            let (entry, _) = self.lock().finalize(&self.registry);
            drop(entry);
            return;
        }
        if let Some(handle) = self.begin_destroy() {
            destroy(handle);
        }
        self.finalize();
    }

    /// Take the subscription out of the wrapper, cancelling it
    pub fn unsubscribe(&self) {
        let subscription = self.lock().subscription.take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// The native object, `None` before attachment and after finalization
    pub fn handle(&self) -> Option<NativeHandle> {
        self.lock().handle
    }

    /// The native object, or [`BridgeError::InvalidId`]
    pub fn live_handle(&self) -> Result<NativeHandle, BridgeError> {
        self.handle().ok_or(BridgeError::InvalidId)
    }

    /// Whether a native parent currently owns the object
    pub fn is_owned(&self) -> bool {
        self.lock().owned
    }

    /// Whether the object is being destroyed through the bridge
    pub fn is_destroying(&self) -> bool {
        let state = self.lock();
        state.destroying && !state.finalized
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        let state = self.lock();
        match (state.finalized, state.handle, state.owned) {
            (true, _, _) => LifecycleState::Destroyed,
            (false, None, _) => LifecycleState::Unbound,
            (false, Some(_), true) => LifecycleState::Attached,
            (false, Some(_), false) if state.was_owned => LifecycleState::Detached,
            (false, Some(_), false) => LifecycleState::Unbound,
        }
    }
}

impl fmt::Debug for NativeObjectWrapper {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("NativeObjectWrapper")
            .field("handle", &state.handle)
            .field("owned", &state.owned)
            .field("finalized", &state.finalized)
            .finish_non_exhaustive()
    }
}
