mod helpers;

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use helpers::*;

use bridge::client::Proxy;
use bridge::core_interfaces::WL_REGISTRY_BIND;
use bridge::dispatch::{Implementation, Value};
use bridge::server::Resource;
use bridge::wrapper::LifecycleState;
use bridge::BridgeError;

fn bound_compositor(server: &TestServer) -> (TestClient, Arc<Proxy>) {
    server.create_compositor(2, empty_server(&COMPOSITOR_INTERFACE), Resources::default());
    let client = server.add_client();
    roundtrip(&client, server).unwrap();
    let compositor = client.bind_compositor(2, empty_client(&COMPOSITOR_INTERFACE));
    roundtrip(&client, server).unwrap();
    (client, compositor)
}

#[test]
fn proxy_user_data() {
    let server = TestServer::new();
    let (_client, compositor) = bound_compositor(&server);

    assert!(compositor.data::<usize>().is_none());
    compositor.set_data(0xDEADBEEFusize).unwrap();
    assert_eq!(compositor.data::<usize>(), Some(&0xDEADBEEF));
    assert!(compositor.data::<u32>().is_none());
    assert!(matches!(compositor.set_data(42usize), Err(BridgeError::AlreadyAssigned)));
    assert_eq!(compositor.data::<usize>(), Some(&0xDEADBEEF));
}

#[test]
fn proxies_are_kept_by_their_connection() {
    let server = TestServer::new();
    let (client, compositor) = bound_compositor(&server);
    let handle = compositor.handle().unwrap();
    let id = compositor.id();
    compositor.set_data(String::from("compositor")).unwrap();
    drop(compositor);

    let found = client.bridge.registry().find_as::<Proxy>(handle).unwrap();
    assert_eq!(found.id(), id);
    assert_eq!(found.data::<String>().map(String::as_str), Some("compositor"));
    assert_eq!(found.state(), LifecycleState::Attached);
    assert!(Arc::ptr_eq(&found.display().unwrap(), &client.display));
}

#[test]
fn each_bind_is_a_distinct_proxy() {
    let server = TestServer::new();
    let (client, first) = bound_compositor(&server);
    let second = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    assert_ne!(first.id(), second.id());
    assert_ne!(first.handle().unwrap(), second.handle().unwrap());
    assert_eq!(second.version(), 1);
    assert_eq!(first.version(), 2);
}

#[test]
fn events_reach_the_proxy_implementation() {
    let server = TestServer::new();
    let created = Resources::default();
    let store = created.clone();
    let compositor_impl = Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("create_surface", move |compositor, values| {
            let client = compositor.client()?;
            let surface = Resource::new(
                &client,
                &SURFACE_INTERFACE,
                1,
                values[0].as_new_id().unwrap(),
                empty_server(&SURFACE_INTERFACE),
            )?;
            client.add_resource(&surface)?;
            surface.post_event(SURFACE_ENTER, &[Value::Int(-12)])?;
            store.lock().unwrap().push(surface);
            Ok(())
        })
        .build()
        .unwrap();
    server.create_compositor(1, compositor_impl, Resources::default());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();
    let compositor = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));

    let entered = Arc::new(AtomicI32::new(0));
    let seen = entered.clone();
    let surface_impl = Implementation::<Proxy>::builder(&SURFACE_INTERFACE)
        .on("enter", move |proxy, values| {
            assert_eq!(proxy.interface().name, "test_surface");
            seen.store(values[0].as_int().unwrap(), Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();
    let surface = compositor
        .marshal_constructor(
            COMPOSITOR_CREATE_SURFACE,
            &[Value::NewId(0)],
            &SURFACE_INTERFACE,
            1,
            surface_impl,
        )
        .unwrap();
    roundtrip(&client, &server).unwrap();

    assert_eq!(entered.load(Ordering::SeqCst), -12);
    assert_eq!(created.lock().unwrap()[0].id(), surface.id());
}

#[test]
fn destroyed_proxies_reject_requests() {
    let server = TestServer::new();
    let (client, compositor) = bound_compositor(&server);
    let handle = compositor.handle().unwrap();

    compositor.destroy();
    assert_eq!(compositor.state(), LifecycleState::Destroyed);
    assert!(!client.bridge.registry().contains(handle));
    assert!(matches!(
        compositor.marshal(COMPOSITOR_PING, &[Value::Uint(1), Value::Str(None)]),
        Err(BridgeError::InvalidId)
    ));
    compositor.destroy();
}

#[test]
fn destructor_requests_destroy_the_proxy() {
    let server = TestServer::new();
    let (_client, compositor) = bound_compositor(&server);
    compositor.marshal(COMPOSITOR_RELEASE, &[]).unwrap();
    assert_eq!(compositor.state(), LifecycleState::Destroyed);
}

#[test]
fn dropping_the_connection_destroys_its_proxies() {
    let server = TestServer::new();
    let resources = Resources::default();
    server.create_compositor(1, empty_server(&COMPOSITOR_INTERFACE), resources.clone());
    let TestClient { bridge: client_bridge, display, registry, globals } = server.add_client();
    display.roundtrip().unwrap();
    let name = globals.lock().unwrap()[0].0;
    let compositor = registry
        .marshal_constructor(
            WL_REGISTRY_BIND,
            &[
                Value::Uint(name),
                Value::Str(Some(COMPOSITOR_INTERFACE.name.into())),
                Value::Uint(1),
                Value::NewId(0),
            ],
            &COMPOSITOR_INTERFACE,
            1,
            empty_client(&COMPOSITOR_INTERFACE),
        )
        .unwrap();
    display.roundtrip().unwrap();
    let resource = resources.lock().unwrap()[0].clone();
    assert_eq!(resource.state(), LifecycleState::Attached);

    drop(display);
    assert_eq!(compositor.state(), LifecycleState::Destroyed);
    assert_eq!(registry.state(), LifecycleState::Destroyed);
    assert!(compositor.display().is_none());
    assert!(client_bridge.registry().is_empty());

    // the server sees the client go away
    assert_eq!(resource.state(), LifecycleState::Destroyed);
    assert!(server.local().display_clients(server.display.handle().unwrap()).is_empty());
}
