use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    registry::{ObjectRegistry, Peer, ReferenceMode},
    types::{BridgeError, HandleKind, ListenerToken, NativeHandle},
    wrapper::{LifecycleState, NativeObjectWrapper, Subscription},
};

/// A peer counting the native destructions and subscription cancellations it causes
struct Object {
    wrapper: NativeObjectWrapper,
    destroyed: Arc<AtomicUsize>,
}

impl Peer for Object {
    fn native_handle(&self) -> Option<NativeHandle> {
        self.wrapper.handle()
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        let destroyed = self.destroyed.clone();
        self.wrapper.release(|_| {
            destroyed.fetch_add(1, Ordering::SeqCst);
        });
    }
}

struct Fixture {
    registry: Arc<ObjectRegistry>,
    handle: NativeHandle,
    destroyed: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            registry: Arc::new(ObjectRegistry::new()),
            handle: NativeHandle::from_addr(HandleKind::Resource, 0x1000).unwrap(),
            destroyed: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn unbound(&self) -> Arc<Object> {
        Arc::new(Object {
            wrapper: NativeObjectWrapper::new(self.registry.clone()),
            destroyed: self.destroyed.clone(),
        })
    }

    fn attached(&self) -> Arc<Object> {
        let object = self.unbound();
        let peer: Arc<dyn Peer> = object.clone();
        let cancelled = self.cancelled.clone();
        object
            .wrapper
            .attach_data(&peer, self.handle, |handle| {
                Ok(Some(Subscription::new(ListenerToken::new(handle, 1), move |_| {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                })))
            })
            .unwrap();
        object
    }

    fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[test]
fn attach_registers_weakly() {
    let fixture = Fixture::new();
    let object = fixture.unbound();
    assert_eq!(object.wrapper.state(), LifecycleState::Unbound);
    assert!(object.wrapper.live_handle().is_err());

    let object = fixture.attached();
    assert_eq!(fixture.registry.mode(fixture.handle), Some(ReferenceMode::Weak));
    assert_eq!(object.wrapper.handle(), Some(fixture.handle));
    assert_eq!(object.wrapper.state(), LifecycleState::Unbound);

    let peer: Arc<dyn Peer> = object.clone();
    let again = object.wrapper.attach_data(&peer, fixture.handle, |_| Ok(None));
    assert!(matches!(again, Err(BridgeError::AlreadyAssigned)));
}

#[test]
fn failed_subscription_rolls_back() {
    let fixture = Fixture::new();
    let object = fixture.unbound();
    let peer: Arc<dyn Peer> = object.clone();
    let ret = object.wrapper.attach_data(&peer, fixture.handle, |_| Err(BridgeError::NoMemory));
    assert!(matches!(ret, Err(BridgeError::NoMemory)));
    assert!(fixture.registry.is_empty());
    assert_eq!(object.wrapper.handle(), None);
}

#[test]
fn free_standing_drop_destroys_native_object() {
    let fixture = Fixture::new();
    let object = fixture.attached();
    drop(object);
    assert_eq!(fixture.destroyed(), 1);
    assert_eq!(fixture.cancelled(), 1);
    assert!(fixture.registry.is_empty());
}

#[test]
fn owned_peer_survives_its_last_reference() {
    let fixture = Fixture::new();
    let object = fixture.attached();
    object.wrapper.mark_owned(None).unwrap();
    assert_eq!(object.wrapper.state(), LifecycleState::Attached);
    assert!(matches!(object.wrapper.mark_owned(None), Err(BridgeError::IllegalState(_))));
    drop(object);

    let object = fixture.registry.find_as::<Object>(fixture.handle).unwrap();
    assert_eq!(fixture.destroyed(), 0);

    // the native parent destroyed the object
    object.wrapper.destroy_notify();
    assert_eq!(object.wrapper.state(), LifecycleState::Destroyed);
    assert!(fixture.registry.is_empty());
    drop(object);
    assert_eq!(fixture.destroyed(), 0);
    // the listener died with the object, it is not removed
    assert_eq!(fixture.cancelled(), 0);
}

#[test]
fn disowned_peer_falls_back_to_weak() {
    let fixture = Fixture::new();
    let object = fixture.attached();
    object.wrapper.mark_owned(None).unwrap();
    object.wrapper.mark_disowned(false).unwrap();
    assert_eq!(object.wrapper.state(), LifecycleState::Detached);
    assert_eq!(fixture.registry.mode(fixture.handle), Some(ReferenceMode::Weak));
    assert_eq!(fixture.cancelled(), 1);
    assert!(matches!(object.wrapper.mark_disowned(false), Err(BridgeError::IllegalState(_))));

    object.wrapper.mark_disowned(true).unwrap();
    assert_eq!(object.wrapper.state(), LifecycleState::Destroyed);
    assert!(fixture.registry.is_empty());
    // disowning a finalized wrapper is allowed
    object.wrapper.mark_disowned(true).unwrap();
    drop(object);
    assert_eq!(fixture.destroyed(), 0);
}

#[test]
fn explicit_destroy_runs_once() {
    let fixture = Fixture::new();
    let object = fixture.attached();
    object.wrapper.mark_owned(None).unwrap();

    let handle = object.wrapper.begin_destroy();
    assert_eq!(handle, Some(fixture.handle));
    assert!(object.wrapper.is_destroying());
    assert_eq!(object.wrapper.begin_destroy(), None);

    // the native destroy signal fires during the destroy call
    object.wrapper.destroy_notify();
    assert_ne!(object.wrapper.state(), LifecycleState::Destroyed);
    assert_eq!(fixture.registry.mode(fixture.handle), Some(ReferenceMode::Weak));

    object.wrapper.finalize();
    assert_eq!(object.wrapper.state(), LifecycleState::Destroyed);
    assert!(!object.wrapper.is_destroying());
    assert!(fixture.registry.is_empty());
    object.wrapper.finalize();
    object.wrapper.destroy_notify();

    drop(object);
    assert_eq!(fixture.destroyed(), 0);
}

#[test]
fn finalized_wrapper_cannot_be_reattached() {
    let fixture = Fixture::new();
    let object = fixture.attached();
    object.wrapper.finalize();
    let peer: Arc<dyn Peer> = object.clone();
    let ret = object.wrapper.attach_data(&peer, fixture.handle, |_| Ok(None));
    assert!(matches!(ret, Err(BridgeError::AlreadyAssigned)));
    assert!(fixture.registry.is_empty());
}

#[test]
fn stale_entry_is_not_removed_by_an_older_peer() {
    let fixture = Fixture::new();
    let old = fixture.attached();
    // the native address got reused by a newer object
    let newer: Arc<dyn Peer> = fixture.unbound();
    fixture.registry.register(fixture.handle, &newer, ReferenceMode::Weak).unwrap();

    old.wrapper.finalize();
    let found = fixture.registry.find(fixture.handle).unwrap();
    assert_eq!(Arc::as_ptr(&found) as *const (), Arc::as_ptr(&newer) as *const ());
}
