mod helpers;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use helpers::*;

use bridge::dispatch::{Implementation, Value};
use bridge::server::{DestroyListener, Resource};
use bridge::wrapper::LifecycleState;
use bridge::BridgeError;

fn counting_listener() -> (Arc<DestroyListener>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let listener = DestroyListener::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (listener, count)
}

/// A compositor creating surfaces which destroy themselves on request
fn surface_compositor(surfaces: Resources) -> Arc<Implementation<Resource>> {
    let surface_impl = Implementation::<Resource>::builder(&SURFACE_INTERFACE)
        .on("destroy", |_, _| Ok(()))
        .build()
        .unwrap();
    Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("create_surface", move |compositor, values| {
            let client = compositor.client()?;
            let id = values[0].as_new_id().unwrap();
            let surface = Resource::new(&client, &SURFACE_INTERFACE, 1, id, surface_impl.clone())?;
            client.add_resource(&surface)?;
            surfaces.lock().unwrap().push(surface);
            Ok(())
        })
        .build()
        .unwrap()
}

#[test]
fn resource_listeners_fire_on_destructor_requests() {
    let server = TestServer::new();
    let surfaces = Resources::default();
    server.create_compositor(1, surface_compositor(surfaces.clone()), Resources::default());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();
    let compositor = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    let surface = compositor
        .marshal_constructor(
            COMPOSITOR_CREATE_SURFACE,
            &[Value::NewId(0)],
            &SURFACE_INTERFACE,
            1,
            empty_client(&SURFACE_INTERFACE),
        )
        .unwrap();
    roundtrip(&client, &server).unwrap();

    let server_surface = surfaces.lock().unwrap()[0].clone();
    let (listener, fired) = counting_listener();
    server_surface.add_destroy_listener(&listener).unwrap();
    assert!(listener.is_attached());

    surface.marshal(SURFACE_DESTROY, &[]).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    roundtrip(&client, &server).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!listener.is_attached());
    assert_eq!(server_surface.state(), LifecycleState::Destroyed);

    // a destroyed object takes no listener
    assert!(matches!(server_surface.add_destroy_listener(&listener), Err(BridgeError::InvalidId)));
}

#[test]
fn listeners_can_be_moved_to_another_object() {
    let server = TestServer::new();
    let resources = Resources::default();
    server.create_compositor(1, empty_server(&COMPOSITOR_INTERFACE), resources.clone());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();
    client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    roundtrip(&client, &server).unwrap();
    let resources = resources.lock().unwrap().clone();

    let (listener, fired) = counting_listener();
    resources[0].add_destroy_listener(&listener).unwrap();
    assert!(matches!(resources[1].add_destroy_listener(&listener), Err(BridgeError::IllegalState(_))));
    listener.detach();
    resources[1].add_destroy_listener(&listener).unwrap();

    resources[0].destroy();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    resources[1].destroy();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn listeners_fire_once_per_attachment() {
    let server = TestServer::new();
    let (listener, fired) = counting_listener();
    let resources = Resources::default();
    server.create_compositor(1, empty_server(&COMPOSITOR_INTERFACE), resources.clone());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();
    client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    roundtrip(&client, &server).unwrap();

    let resource = resources.lock().unwrap()[0].clone();
    let server_client = resource.client().unwrap();
    resource.add_destroy_listener(&listener).unwrap();
    resource.destroy();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // the listener can be reused once it fired
    server_client.add_destroy_listener(&listener).unwrap();
    server_client.destroy();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert!(!listener.is_attached());
}

#[test]
fn display_destruction_order() {
    let server = TestServer::new();
    let resources = Resources::default();
    server.create_compositor(1, empty_server(&COMPOSITOR_INTERFACE), resources.clone());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();
    client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    roundtrip(&client, &server).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let resource = resources.lock().unwrap()[0].clone();
    let server_client = resource.client().unwrap();
    let mut listeners = Vec::new();
    for name in ["resource", "client", "display"] {
        let order = order.clone();
        listeners.push(DestroyListener::new(move || order.lock().unwrap().push(name)));
    }
    resource.add_destroy_listener(&listeners[0]).unwrap();
    server_client.add_destroy_listener(&listeners[1]).unwrap();
    server.display.add_destroy_listener(&listeners[2]).unwrap();

    server.display.destroy();
    // a client signals its destruction before destroying its resources
    assert_eq!(*order.lock().unwrap(), ["client", "resource", "display"]);
    assert!(listeners.iter().all(|l| !l.is_attached()));
}
