mod helpers;

use std::sync::Arc;

use helpers::*;

use bridge::client::Proxy;
use bridge::dispatch::{Implementation, Value};
use bridge::protocol::SERVER_ID_LIMIT;
use bridge::server::{Client, Resource};
use bridge::wrapper::LifecycleState;
use bridge::BridgeError;

struct Bound {
    server: TestServer,
    client: TestClient,
    compositor: Arc<Proxy>,
    resource: Arc<Resource>,
}

fn bind_compositor(version: u32, implementation: Arc<Implementation<Resource>>) -> Bound {
    let server = TestServer::new();
    let resources = Resources::default();
    server.create_compositor(2, implementation, resources.clone());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();
    let compositor = client.bind_compositor(version, empty_client(&COMPOSITOR_INTERFACE));
    roundtrip(&client, &server).unwrap();
    let resource = resources.lock().unwrap()[0].clone();
    Bound { server, client, compositor, resource }
}

#[test]
fn resource_user_data() {
    let bound = bind_compositor(1, empty_server(&COMPOSITOR_INTERFACE));
    let resource = &bound.resource;
    assert!(resource.data::<u32>().is_none());
    resource.set_data(1000u32).unwrap();
    assert_eq!(resource.data::<u32>(), Some(&1000));
    assert!(resource.data::<i32>().is_none());
    assert!(matches!(resource.set_data(()), Err(BridgeError::AlreadyAssigned)));
}

#[test]
fn resources_are_kept_by_their_client() {
    let bound = bind_compositor(1, empty_server(&COMPOSITOR_INTERFACE));
    let Bound { server, client: _client, compositor, resource } = bound;
    let handle = resource.handle().unwrap();
    resource.set_data(7u8).unwrap();
    drop(resource);

    let resource = server.bridge.registry().find_as::<Resource>(handle).unwrap();
    assert_eq!(resource.data::<u8>(), Some(&7));
    assert_eq!(resource.id(), compositor.id());
    assert_eq!(resource.interface().name, "test_compositor");
    assert_eq!(resource.state(), LifecycleState::Attached);
}

#[test]
fn free_standing_resources_die_with_their_last_reference() {
    let bound = bind_compositor(1, empty_server(&COMPOSITOR_INTERFACE));
    let client = bound.resource.client().unwrap();
    let surface = Resource::new(&client, &SURFACE_INTERFACE, 1, 0, empty_server(&SURFACE_INTERFACE)).unwrap();
    let handle = surface.handle().unwrap();
    assert!(surface.id() >= SERVER_ID_LIMIT);
    assert!(bound.server.local().is_alive(handle));

    drop(surface);
    assert!(!bound.server.local().is_alive(handle));
    assert!(!bound.server.bridge.registry().contains(handle));
}

#[test]
fn resources_belong_to_one_client() {
    let bound = bind_compositor(1, empty_server(&COMPOSITOR_INTERFACE));
    let other = bound.server.add_client();
    roundtrip(&other, &bound.server).unwrap();
    other.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    // binding makes the other client known to the bridge
    roundtrip(&other, &bound.server).unwrap();

    let clients = bound.server.local().display_clients(bound.server.display.handle().unwrap());
    assert_eq!(clients.len(), 2);
    let owner = bound.resource.client().unwrap();
    let stranger = clients
        .iter()
        .filter(|&&handle| handle != owner.handle().unwrap())
        .find_map(|&handle| bound.server.bridge.registry().find_as::<Client>(handle))
        .unwrap();
    assert!(matches!(stranger.add_resource(&bound.resource), Err(BridgeError::IllegalState(_))));
}

#[test]
fn implementations_must_match_the_interface() {
    let bound = bind_compositor(1, empty_server(&COMPOSITOR_INTERFACE));
    let client = bound.resource.client().unwrap();
    let ret = Resource::new(&client, &SURFACE_INTERFACE, 1, 0, empty_server(&COMPOSITOR_INTERFACE));
    assert!(matches!(ret, Err(BridgeError::IllegalState(_))));
}

#[test]
fn events_are_checked_against_the_resource_version() {
    let bound = bind_compositor(1, empty_server(&COMPOSITOR_INTERFACE));
    let ret = bound.resource.post_event(COMPOSITOR_CONFIGURED, &[]);
    assert!(matches!(ret, Err(BridgeError::IllegalState(_))));
    assert!(matches!(
        bound.resource.post_event(COMPOSITOR_PONG, &[Value::Int(1)]),
        Err(BridgeError::Marshal(_))
    ));

    let bound = bind_compositor(2, empty_server(&COMPOSITOR_INTERFACE));
    bound.resource.post_event(COMPOSITOR_CONFIGURED, &[]).unwrap();
}

#[test]
fn server_side_destruction() {
    let bound = bind_compositor(1, empty_server(&COMPOSITOR_INTERFACE));
    let handle = bound.resource.handle().unwrap();
    bound.resource.destroy();
    assert_eq!(bound.resource.state(), LifecycleState::Destroyed);
    assert!(!bound.server.local().is_alive(handle));
    assert!(!bound.server.bridge.registry().contains(handle));
    assert!(matches!(bound.resource.post_event(COMPOSITOR_PONG, &[Value::Uint(1)]), Err(BridgeError::InvalidId)));
    bound.resource.destroy();

    // the client side proxy is untouched
    assert_eq!(bound.compositor.state(), LifecycleState::Attached);
    assert!(bound.client.display.protocol_error().is_none());
}

#[test]
fn destructor_requests_destroy_the_resource() {
    let implementation = Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("release", |_, _| Ok(()))
        .build()
        .unwrap();
    let bound = bind_compositor(2, implementation);
    let handle = bound.resource.handle().unwrap();

    bound.compositor.marshal(COMPOSITOR_RELEASE, &[]).unwrap();
    assert_eq!(bound.resource.state(), LifecycleState::Attached);
    roundtrip(&bound.client, &bound.server).unwrap();
    assert_eq!(bound.resource.state(), LifecycleState::Destroyed);
    assert!(!bound.server.bridge.registry().contains(handle));
}
