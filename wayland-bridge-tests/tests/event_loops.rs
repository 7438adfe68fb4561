mod helpers;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use helpers::*;

use bridge::client::Proxy;
use bridge::dispatch::{Implementation, Value};
use bridge::server::{EventLoop, Resource};
use bridge::wrapper::LifecycleState;
use bridge::BridgeError;

#[test]
fn display_runs_until_terminated() {
    let server = TestServer::new();
    let event_loop = server.display.event_loop().unwrap();
    let display = Arc::downgrade(&server.display);
    event_loop
        .add_idle(move || {
            if let Some(display) = display.upgrade() {
                display.terminate();
            }
        })
        .unwrap();
    server.display.run().unwrap();
    assert!(server.display.handle().is_ok());
}

#[test]
fn idle_sources_added_while_idle_run_in_the_same_pass() {
    let server = TestServer::new();
    let event_loop = server.display.event_loop().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let weak_loop = Arc::downgrade(&event_loop);
    let outer = order.clone();
    event_loop
        .add_idle(move || {
            outer.lock().unwrap().push("first");
            let inner = outer.clone();
            if let Some(event_loop) = weak_loop.upgrade() {
                event_loop.add_idle(move || inner.lock().unwrap().push("second")).unwrap();
            }
        })
        .unwrap();
    event_loop.dispatch_idle().unwrap();
    assert_eq!(*order.lock().unwrap(), ["first", "second"]);
}

#[test]
fn checked_sources_are_dispatched_again() {
    let server = TestServer::new();
    let event_loop = EventLoop::create(&server.bridge).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let timer = event_loop
        .add_timer(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            // ask to be called again until the third call
            (3 - n.min(3)) as i32
        })
        .unwrap();
    timer.check().unwrap();
    timer.update_timer(1).unwrap();
    event_loop.dispatch(Some(Duration::from_millis(500))).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn dropping_a_standalone_loop_destroys_it() {
    let server = TestServer::new();
    let event_loop = EventLoop::create(&server.bridge).unwrap();
    let loop_handle = event_loop.handle().unwrap();
    let timer = event_loop.add_timer(|| 0).unwrap();
    let idle = event_loop.add_idle(|| ()).unwrap();
    let sources = [timer.handle().unwrap(), idle.handle().unwrap()];

    drop(event_loop);
    assert!(!server.local().is_alive(loop_handle));
    assert_eq!(timer.state(), LifecycleState::Destroyed);
    assert_eq!(idle.state(), LifecycleState::Destroyed);
    assert!(matches!(timer.update_timer(5), Err(BridgeError::InvalidId)));
    assert!(!server.bridge.registry().contains(loop_handle));
    for source in sources {
        assert!(!server.bridge.registry().contains(source));
    }
}

#[test]
fn server_dispatch_processes_client_requests() {
    let server = TestServer::new();
    let pings = Arc::new(AtomicUsize::new(0));
    let counter = pings.clone();
    let implementation = Implementation::<Resource>::builder(&COMPOSITOR_INTERFACE)
        .on("ping", move |compositor, values| {
            counter.fetch_add(1, Ordering::SeqCst);
            compositor.post_event(COMPOSITOR_PONG, &values[..1])?;
            Ok(())
        })
        .build()
        .unwrap();
    server.create_compositor(1, implementation, Resources::default());
    let client = server.add_client();
    roundtrip(&client, &server).unwrap();

    let pongs = Arc::new(Mutex::new(Vec::new()));
    let record = pongs.clone();
    let client_impl = Implementation::<Proxy>::builder(&COMPOSITOR_INTERFACE)
        .on("pong", move |_, values| {
            record.lock().unwrap().push(values[0].as_uint().unwrap());
            Ok(())
        })
        .build()
        .unwrap();
    let compositor = client.bind_compositor(1, client_impl);
    for serial in 1..=3 {
        compositor.marshal(COMPOSITOR_PING, &[Value::Uint(serial), Value::Str(None)]).unwrap();
    }
    assert_eq!(pings.load(Ordering::SeqCst), 0);

    server.answer();
    assert_eq!(pings.load(Ordering::SeqCst), 3);
    assert!(pongs.lock().unwrap().is_empty());
    assert_eq!(client.display.dispatch_pending().unwrap(), 3);
    assert_eq!(*pongs.lock().unwrap(), [1, 2, 3]);
}
