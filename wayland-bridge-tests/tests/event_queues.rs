#[macro_use]
mod helpers;

use std::sync::{Arc, Mutex};
use std::thread;

use helpers::*;

use bridge::client::{EventQueue, Proxy};
use bridge::dispatch::{Implementation, Value};
use bridge::server::Resource;
use bridge::wrapper::LifecycleState;
use bridge::BridgeError;

type Pongs = Arc<Mutex<Vec<u32>>>;

/// A client bound to a compositor answering every ping with a pong of the same serial
fn ponging_compositor(server: &TestServer, pongs: &Pongs) -> (TestClient, Arc<Proxy>) {
    let implementation = Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("ping", |compositor, values| {
            compositor.post_event(COMPOSITOR_PONG, &[values[0].clone()])?;
            Ok(())
        })
        .on("create_surface", |compositor, values| {
            let client = compositor.client()?;
            let id = values[0].as_new_id().unwrap();
            let surface = Resource::new(&client, &SURFACE_INTERFACE, 1, id, empty_server(&SURFACE_INTERFACE))?;
            client.add_resource(&surface)?;
            surface.post_event(SURFACE_ENTER, &[Value::Int(5)])?;
            Ok(())
        })
        .build()
        .unwrap();
    server.create_compositor(1, implementation, Resources::default());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();
    let pongs = pongs.clone();
    let client_impl = Implementation::<Proxy>::builder(&COMPOSITOR_INTERFACE)
        .on("pong", move |_, values| {
            pongs.lock().unwrap().push(values[0].as_uint().unwrap());
            Ok(())
        })
        .build()
        .unwrap();
    let compositor = client.bind_compositor(1, client_impl);
    roundtrip(&client, &server).unwrap();
    (client, compositor)
}

fn ping(compositor: &Proxy, serial: u32) {
    compositor.marshal(COMPOSITOR_PING, &[Value::Uint(serial), Value::Str(None)]).unwrap();
}

backend_test!(events_wait_for_the_queue_of_their_proxy, |server| {
    let pongs = Pongs::default();
    let (client, compositor) = ponging_compositor(&server, &pongs);
    let queue = client.display.create_queue().unwrap();
    compositor.set_queue(Some(&queue)).unwrap();

    ping(&compositor, 1);
    roundtrip(&client, &server).unwrap();
    assert!(pongs.lock().unwrap().is_empty());
    assert_eq!(client.display.dispatch_queue_pending(&queue).unwrap(), 1);
    assert_eq!(*pongs.lock().unwrap(), [1]);
    assert_eq!(client.display.dispatch_queue_pending(&queue).unwrap(), 0);

    compositor.set_queue(None).unwrap();
    ping(&compositor, 2);
    roundtrip(&client, &server).unwrap();
    assert_eq!(*pongs.lock().unwrap(), [1, 2]);
});

backend_test!(created_objects_start_on_the_queue_of_their_parent, |server| {
    let (client, compositor) = ponging_compositor(&server, &Pongs::default());
    let queue = EventQueue::new(&client.display).unwrap();
    compositor.set_queue(Some(&queue)).unwrap();

    let entered = Arc::new(Mutex::new(Vec::new()));
    let record = entered.clone();
    let surface_impl = Implementation::<Proxy>::builder(&SURFACE_INTERFACE)
        .on("enter", move |_, values| {
            record.lock().unwrap().push(values[0].as_int().unwrap());
            Ok(())
        })
        .build()
        .unwrap();
    compositor
        .marshal_constructor(COMPOSITOR_CREATE_SURFACE, &[Value::NewId(0)], &SURFACE_INTERFACE, 1, surface_impl)
        .unwrap();
    roundtrip(&client, &server).unwrap();
    assert!(entered.lock().unwrap().is_empty());
    assert_eq!(client.display.dispatch_queue_pending(&queue).unwrap(), 1);
    assert_eq!(*entered.lock().unwrap(), [5]);
});

backend_test!(destroyed_queues_hand_their_proxies_back, |server| {
    let pongs = Pongs::default();
    let (client, compositor) = ponging_compositor(&server, &pongs);
    let queue = client.display.create_queue().unwrap();
    compositor.set_queue(Some(&queue)).unwrap();
    let handle = queue.handle().unwrap();
    assert!(client.bridge.registry().contains(handle));

    queue.destroy();
    assert_eq!(queue.state(), LifecycleState::Destroyed);
    assert!(!client.bridge.registry().contains(handle));
    assert!(matches!(client.display.dispatch_queue_pending(&queue), Err(BridgeError::InvalidId)));

    ping(&compositor, 3);
    roundtrip(&client, &server).unwrap();
    assert_eq!(*pongs.lock().unwrap(), [3]);
});

backend_test!(queues_are_dispatched_by_their_own_thread, |server| {
    let pongs = Pongs::default();
    let (client, compositor) = ponging_compositor(&server, &pongs);
    let queue = client.display.create_queue().unwrap();
    compositor.set_queue(Some(&queue)).unwrap();
    ping(&compositor, 4);
    roundtrip(&client, &server).unwrap();

    let worker = {
        let (display, queue) = (client.display.clone(), queue.clone());
        thread::spawn(move || display.dispatch_queue_pending(&queue).unwrap())
    };
    assert_eq!(worker.join().unwrap(), 1);
    assert_eq!(*pongs.lock().unwrap(), [4]);
});

backend_test!(disconnecting_destroys_the_queues, |server| {
    let (client, compositor) = ponging_compositor(&server, &Pongs::default());
    let queue = client.display.create_queue().unwrap();
    compositor.set_queue(Some(&queue)).unwrap();

    client.display.disconnect();
    assert_eq!(queue.state(), LifecycleState::Destroyed);
    assert_eq!(compositor.state(), LifecycleState::Destroyed);
    assert!(matches!(client.display.dispatch_queue(&queue), Err(BridgeError::InvalidId)));
    drop(queue);
});
