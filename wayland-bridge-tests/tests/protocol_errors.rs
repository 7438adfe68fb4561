mod helpers;

use std::sync::Arc;

use helpers::*;

use bridge::dispatch::{Implementation, MarshalError, RequestError, Value};
use bridge::protocol::DisplayError;
use bridge::server::Resource;
use bridge::wrapper::LifecycleState;
use bridge::{BridgeError, NativeError};

fn compositor_with(implementation: Arc<Implementation<Resource>>) -> (TestServer, TestClient, Resources) {
    let server = TestServer::new();
    let resources = Resources::default();
    server.create_compositor(1, implementation, resources.clone());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();
    (server, client, resources)
}

fn ping(id: u32) -> [Value<'static>; 2] {
    [Value::Uint(id), Value::Str(None)]
}

#[test]
fn resource_errors_kill_the_client() {
    let implementation = Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("ping", |compositor, values| {
            let id = values[0].as_uint().unwrap();
            compositor.post_error(5, &format!("ping {id} is 100% invalid"));
            Ok(())
        })
        .build()
        .unwrap();
    let (server, client, resources) = compositor_with(implementation);
    let compositor = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    roundtrip(&client, &server).unwrap();
    let resource = resources.lock().unwrap()[0].clone();
    let server_client = resource.client().unwrap();
    let client_handle = server_client.handle().unwrap();

    compositor.marshal(COMPOSITOR_PING, &ping(3)).unwrap();
    let err = protocol_error(roundtrip(&client, &server).unwrap_err());
    assert_eq!(err.code, 5);
    assert_eq!(err.object_id, compositor.id());
    assert_eq!(err.object_interface, "test_compositor");
    assert_eq!(err.message, "ping 3 is 100% invalid");

    // the error is sticky on the client side
    assert_eq!(client.display.protocol_error(), Some(err.clone()));
    let again = compositor.marshal(COMPOSITOR_PING, &ping(4)).unwrap_err();
    assert_eq!(protocol_error(again), err);

    // and the server forgot the client
    let posted = server.local().client_protocol_error(client_handle).unwrap();
    assert_eq!(posted.code, 5);
    assert_eq!(server_client.state(), LifecycleState::Destroyed);
    assert_eq!(resource.state(), LifecycleState::Destroyed);
    assert!(!server.bridge.registry().contains(client_handle));
}

#[test]
fn handler_protocol_errors() {
    let implementation = Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("ping", |_, _| Err(RequestError::protocol(DisplayError::Implementation as u32, "ping refused")))
        .build()
        .unwrap();
    let (server, client, _resources) = compositor_with(implementation);
    let compositor = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    compositor.marshal(COMPOSITOR_PING, &ping(1)).unwrap();
    let err = protocol_error(roundtrip(&client, &server).unwrap_err());
    assert_eq!(err.code, DisplayError::Implementation as u32);
    assert_eq!(err.object_id, compositor.id());
    assert_eq!(err.message, "ping refused");
}

#[test]
fn out_of_memory() {
    let implementation = Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("ping", |_, _| Err(RequestError::NoMemory))
        .build()
        .unwrap();
    let (server, client, _resources) = compositor_with(implementation);
    let compositor = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    compositor.marshal(COMPOSITOR_PING, &ping(1)).unwrap();
    let err = protocol_error(roundtrip(&client, &server).unwrap_err());
    assert_eq!(err.code, DisplayError::NoMemory as u32);
    assert_eq!(err.object_id, 1);
}

#[test]
fn requests_without_handler() {
    let (server, client, _resources) = compositor_with(empty_server(&COMPOSITOR_INTERFACE));
    let compositor = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    compositor.marshal(COMPOSITOR_PING, &ping(1)).unwrap();
    let err = protocol_error(roundtrip(&client, &server).unwrap_err());
    assert_eq!(err.code, DisplayError::InvalidMethod as u32);
    assert_eq!(err.object_interface, "test_compositor");
}

#[test]
fn invalid_arguments_are_not_sent() {
    let (server, client, _resources) = compositor_with(empty_server(&COMPOSITOR_INTERFACE));
    let compositor = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));

    let null = compositor.marshal(COMPOSITOR_ATTACH, &[Value::Object(None)]).unwrap_err();
    assert!(matches!(null, BridgeError::Marshal(MarshalError::NullArgument { index: 0 })));

    let wrong = compositor.marshal(COMPOSITOR_PING, &[Value::Int(1), Value::Str(None)]).unwrap_err();
    assert!(matches!(wrong, BridgeError::Marshal(MarshalError::TypeMismatch { index: 0 })));

    // an object of another connection has no id on this one
    let other = server.add_client();
    roundtrip(&other, &server).unwrap();
    let foreign = other.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    let peer: Arc<dyn bridge::registry::Peer> = foreign;
    let err = compositor.marshal(COMPOSITOR_ATTACH, &[Value::Object(Some(peer))]).unwrap_err();
    assert!(matches!(err, BridgeError::Native(NativeError::InvalidObject)));

    // nothing reached the server
    roundtrip(&client, &server).unwrap();
    assert!(client.display.protocol_error().is_none());
}

#[test]
fn failed_handlers_are_only_logged() {
    let implementation = Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("ping", |_, values| match values[1].as_str() {
            Some(reason) => Err(RequestError::failed(reason.to_owned())),
            None => Ok(()),
        })
        .build()
        .unwrap();
    let (server, client, resources) = compositor_with(implementation);
    let compositor = client.bind_compositor(1, empty_client(&COMPOSITOR_INTERFACE));
    compositor
        .marshal(COMPOSITOR_PING, &[Value::Uint(1), Value::Str(Some("database is down".into()))])
        .unwrap();
    roundtrip(&client, &server).unwrap();
    assert!(client.display.protocol_error().is_none());
    assert_eq!(resources.lock().unwrap()[0].state(), LifecycleState::Attached);
}
