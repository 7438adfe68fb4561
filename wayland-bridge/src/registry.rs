//! Identity registry: the map from native handles to their Rust peers
//!
//! Every native object known to the bridge has exactly one entry, holding its peer either strongly
//! (the native side owns the object, the peer must stay alive whatever Rust code does with it) or
//! weakly (the peer lives as long as Rust code references it).

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
};

use downcast_rs::{impl_downcast, DowncastSync};

use crate::types::{BridgeError, NativeHandle};

/// A Rust object representing a native object
pub trait Peer: DowncastSync {
    /// The native object this peer represents, `None` once it is destroyed
    fn native_handle(&self) -> Option<NativeHandle>;

    /// Short description used in logs
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.native_handle() {
            Some(handle) => write!(f, "peer of {handle}"),
            None => f.write_str("peer of a dead object"),
        }
    }
}

impl_downcast!(sync Peer);

impl fmt::Debug for dyn Peer {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(f)
    }
}

/// How the registry holds a peer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceMode {
    /// The peer is kept alive by the registry
    Strong,
    /// The peer is only reachable while referenced elsewhere
    Weak,
}

/// A reference to a peer as stored by the registry
#[derive(Clone)]
pub enum PeerRef {
    /// A strong reference
    Strong(Arc<dyn Peer>),
    /// A weak reference
    Weak(Weak<dyn Peer>),
}

impl PeerRef {
    fn new(peer: &Arc<dyn Peer>, mode: ReferenceMode) -> Self {
        match mode {
            ReferenceMode::Strong => Self::Strong(peer.clone()),
            ReferenceMode::Weak => Self::Weak(Arc::downgrade(peer)),
        }
    }

    /// The mode of this reference
    pub fn mode(&self) -> ReferenceMode {
        match self {
            Self::Strong(_) => ReferenceMode::Strong,
            Self::Weak(_) => ReferenceMode::Weak,
        }
    }

    /// Get a live reference to the peer, `None` if a weak reference decayed
    pub fn upgrade(&self) -> Option<Arc<dyn Peer>> {
        match self {
            Self::Strong(peer) => Some(peer.clone()),
            Self::Weak(peer) => peer.upgrade(),
        }
    }

    fn addr(&self) -> *const () {
        match self {
            Self::Strong(peer) => Arc::as_ptr(peer) as *const (),
            Self::Weak(peer) => Weak::as_ptr(peer) as *const (),
        }
    }

    /// Whether this reference designates the same allocation as `peer`
    pub fn refers_to(&self, peer: &Weak<dyn Peer>) -> bool {
        self.addr() == Weak::as_ptr(peer) as *const ()
    }
}

impl fmt::Debug for PeerRef {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:p})", self.mode(), self.addr())
    }
}

/// The map from native handles to peers
///
/// All operations are a single critical section of an internal mutex. References leaving the map
/// are always dropped after that mutex is released, as dropping a peer can re-enter the registry.
pub struct ObjectRegistry {
    entries: Mutex<HashMap<NativeHandle, PeerRef>>,
}

impl ObjectRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// The registry of the process
    ///
    /// It is created on first use and lives until the process exits, as native callbacks may fire
    /// for as long as the native library is loaded.
    pub fn process() -> Arc<Self> {
        static PROCESS: OnceLock<Arc<ObjectRegistry>> = OnceLock::new();
        PROCESS.get_or_init(|| Arc::new(Self::new())).clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NativeHandle, PeerRef>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace the entry of `handle`
    ///
    /// Returns the reference now stored. Fails with [`BridgeError::NoMemory`] if the map cannot
    /// grow, in which case the registry is left untouched.
    pub fn register(
        &self,
        handle: NativeHandle,
        peer: &Arc<dyn Peer>,
        mode: ReferenceMode,
    ) -> Result<PeerRef, BridgeError> {
        let new_ref = PeerRef::new(peer, mode);
        let old = {
            let mut entries = self.lock();
            entries.try_reserve(1).map_err(|_| BridgeError::NoMemory)?;
            entries.insert(handle, new_ref.clone())
        };
        drop(old);
        Ok(new_ref)
    }

    /// Find the peer of `handle`
    ///
    /// A weak entry whose peer is gone is removed.
    pub fn find(&self, handle: NativeHandle) -> Option<Arc<dyn Peer>> {
        let stale = {
            let mut entries = self.lock();
            let entry = entries.get(&handle)?;
            if let Some(peer) = entry.upgrade() {
                return Some(peer);
            }
            entries.remove(&handle)
        };
        drop(stale);
        None
    }

    /// Find the peer of `handle` as a concrete type
    pub fn find_as<T: Peer>(&self, handle: NativeHandle) -> Option<Arc<T>> {
        self.find(handle)?.downcast_arc::<T>().ok()
    }

    /// Remove the entry of `handle`
    pub fn unregister(&self, handle: NativeHandle) {
        drop(self.take(handle));
    }

    /// Make the entry of `handle` strong, inserting it if needed
    pub fn promote(&self, handle: NativeHandle, peer: Arc<dyn Peer>) -> Result<(), BridgeError> {
        drop(self.promote_entry(handle, peer)?);
        Ok(())
    }

    /// Make the entry of `handle` weak
    ///
    /// Does nothing if there is no entry.
    pub fn demote(&self, handle: NativeHandle) {
        drop(self.downgrade(handle));
    }

    /// Current mode of the entry of `handle`
    pub fn mode(&self, handle: NativeHandle) -> Option<ReferenceMode> {
        self.lock().get(&handle).map(PeerRef::mode)
    }

    /// Whether `handle` has an entry, live or not
    pub fn contains(&self, handle: NativeHandle) -> bool {
        self.lock().contains_key(&handle)
    }

    /// Number of entries, including decayed weak entries not pruned yet
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn take(&self, handle: NativeHandle) -> Option<PeerRef> {
        self.lock().remove(&handle)
    }

    /// Remove the entry of `handle` only if it still refers to `peer`
    ///
    /// Native addresses are reused, the entry may already belong to a newer object.
    pub(crate) fn take_peer(&self, handle: NativeHandle, peer: &Weak<dyn Peer>) -> Option<PeerRef> {
        let mut entries = self.lock();
        if entries.get(&handle)?.refers_to(peer) {
            entries.remove(&handle)
        } else {
            None
        }
    }

    pub(crate) fn promote_entry(
        &self,
        handle: NativeHandle,
        peer: Arc<dyn Peer>,
    ) -> Result<Option<PeerRef>, BridgeError> {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&handle) {
            return Ok(Some(std::mem::replace(entry, PeerRef::Strong(peer))));
        }
        entries.try_reserve(1).map_err(|_| BridgeError::NoMemory)?;
        entries.insert(handle, PeerRef::Strong(peer));
        Ok(None)
    }

    /// Replace a strong entry by a weak one, returning the strong reference
    pub(crate) fn downgrade(&self, handle: NativeHandle) -> Option<PeerRef> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&handle)?;
        let weak = match entry {
            PeerRef::Strong(peer) => PeerRef::Weak(Arc::downgrade(peer)),
            PeerRef::Weak(_) => return None,
        };
        Some(std::mem::replace(entry, weak))
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectRegistry {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // formatting a peer takes its wrapper lock, which ranks before the registry lock
        let entries: Vec<(NativeHandle, PeerRef)> =
            self.lock().iter().map(|(handle, entry)| (*handle, entry.clone())).collect();
        let formatted = f.debug_map().entries(entries.iter().map(|(h, e)| (h, e))).finish();
        drop(entries);
        formatted
    }
}
