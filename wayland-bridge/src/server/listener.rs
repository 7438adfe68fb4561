use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{native::ServerLibrary, types::BridgeError, wrapper::Subscription};

/// A callback run when a native object is destroyed
///
/// A listener is attached to one object at a time, through the `add_destroy_listener` method of
/// the object. While attached, the listener is kept alive by the native object; once its callback
/// ran it detaches itself and can be attached again.
pub struct DestroyListener {
    callback: Box<dyn Fn() + Send + Sync>,
    subscription: Mutex<Option<Subscription>>,
}

impl DestroyListener {
    /// Create a detached listener
    pub fn new<F: Fn() + Send + Sync + 'static>(callback: F) -> Arc<Self> {
        Arc::new(Self { callback: Box::new(callback), subscription: Mutex::new(None) })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(
        self: &Arc<Self>,
        library: &Arc<dyn ServerLibrary>,
        object: crate::NativeHandle,
    ) -> Result<(), BridgeError> {
        let mut subscription = self.lock();
        if subscription.is_some() {
            return Err(BridgeError::IllegalState("listener already attached"));
        }
        let listener = self.clone();
        let token = library.add_destroy_listener(object, Box::new(move |_| listener.fire()))?;
        let library = library.clone();
        *subscription =
            Some(Subscription::new(token, move |token| library.remove_destroy_listener(token)));
        Ok(())
    }

    fn fire(&self) {
        // the native library already released the listener
        let subscription = self.lock().take();
        drop(subscription);
        (self.callback)();
    }

    /// Detach the listener without running its callback
    pub fn detach(&self) {
        let subscription = self.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Whether the listener is attached to an object
    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }
}

impl fmt::Debug for DestroyListener {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyListener").field("attached", &self.is_attached()).finish_non_exhaustive()
    }
}
