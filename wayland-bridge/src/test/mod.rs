#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    client::{self, ClientBridge, Proxy},
    core_interfaces::{WL_REGISTRY_BIND, WL_REGISTRY_INTERFACE},
    dispatch::{Implementation, RequestError, Value},
    native::local::LocalLibrary,
    protocol::{AllowNull, ArgumentType, Interface, MessageDesc},
    registry::ObjectRegistry,
    server::{self, GlobalHandler, Resource, ServerBridge},
    types::BridgeError,
};

mod lifecycle;
mod marshalling;

pub(crate) const REQ_MANY_ARGS: u32 = 0;
pub(crate) const REQ_CREATE: u32 = 1;
pub(crate) const REQ_LINK: u32 = 2;
pub(crate) const REQ_FAIL: u32 = 3;
pub(crate) const REQ_DESTROY: u32 = 4;
pub(crate) const REQ_NEWER: u32 = 5;

pub(crate) const EV_MANY_ARGS: u32 = 0;
pub(crate) const EV_SPAWNED: u32 = 1;

pub(crate) const OBJ_DONE: u32 = 0;

const MANY_ARGS: &[ArgumentType] = &[
    ArgumentType::Uint,
    ArgumentType::Int,
    ArgumentType::Fixed,
    ArgumentType::Array,
    ArgumentType::Str(AllowNull::No),
    ArgumentType::Str(AllowNull::Yes),
];

pub(crate) static TEST_GLOBAL_INTERFACE: Interface = Interface {
    name: "test_global",
    version: 3,
    requests: &[
        MessageDesc {
            name: "many_args",
            signature: MANY_ARGS,
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "create",
            signature: &[ArgumentType::NewId],
            since: 1,
            is_destructor: false,
            child_interface: Some(&TEST_OBJECT_INTERFACE),
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "link",
            signature: &[ArgumentType::Object(AllowNull::Yes)],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[&TEST_OBJECT_INTERFACE],
        },
        MessageDesc {
            name: "fail",
            signature: &[],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "destroy",
            signature: &[],
            since: 1,
            is_destructor: true,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "newer",
            signature: &[],
            since: 3,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
    events: &[
        MessageDesc {
            name: "many_args",
            signature: MANY_ARGS,
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "spawned",
            signature: &[ArgumentType::NewId],
            since: 1,
            is_destructor: false,
            child_interface: Some(&TEST_OBJECT_INTERFACE),
            arg_interfaces: &[],
        },
    ],
};

pub(crate) static TEST_OBJECT_INTERFACE: Interface = Interface {
    name: "test_object",
    version: 1,
    requests: &[MessageDesc {
        name: "destroy",
        signature: &[],
        since: 1,
        is_destructor: true,
        child_interface: None,
        arg_interfaces: &[],
    }],
    events: &[MessageDesc {
        name: "done",
        signature: &[ArgumentType::Uint],
        since: 1,
        is_destructor: false,
        child_interface: None,
        arg_interfaces: &[],
    }],
};

/// A server and a client bridge over a private library, with one listening display
pub(crate) struct TestEnv {
    pub(crate) library: Arc<LocalLibrary>,
    pub(crate) server: Arc<ServerBridge>,
    pub(crate) client: Arc<ClientBridge>,
    pub(crate) display: Arc<server::Display>,
    pub(crate) socket: String,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let library = Arc::new(LocalLibrary::new());
        // each side has its own registry, as two processes would
        let server = ServerBridge::new(library.clone(), Arc::new(ObjectRegistry::new()));
        let client = ClientBridge::new(library.clone(), Arc::new(ObjectRegistry::new()));
        let display = server::Display::create(&server).unwrap();
        let socket = display.add_socket_auto().unwrap();
        Self { library, server, client, display, socket }
    }

    pub(crate) fn connect(&self) -> Arc<client::Display> {
        client::Display::connect(&self.client, Some(&self.socket)).unwrap()
    }

    pub(crate) fn dispatch_server(&self) {
        self.display.dispatch(Some(Duration::ZERO)).unwrap();
    }
}

/// Globals announced to a client registry, as `(name, interface, version)`
pub(crate) type Announced = Arc<Mutex<Vec<(u32, String, u32)>>>;

pub(crate) fn get_registry(display: &Arc<client::Display>) -> (Arc<Proxy>, Announced) {
    let announced = Announced::default();
    let added = announced.clone();
    let removed = announced.clone();
    let implementation = Implementation::<Proxy>::builder(&WL_REGISTRY_INTERFACE)
        .on("global", move |_, values| {
            let name = values[0].as_uint().unwrap();
            let interface = values[1].as_str().unwrap().to_owned();
            let version = values[2].as_uint().unwrap();
            added.lock().unwrap().push((name, interface, version));
            Ok(())
        })
        .on("global_remove", move |_, values| {
            let name = values[0].as_uint().unwrap();
            removed.lock().unwrap().retain(|(n, _, _)| *n != name);
            Ok(())
        })
        .build()
        .unwrap();
    (display.get_registry(implementation).unwrap(), announced)
}

/// Send `wl_registry.bind` for the global `name`
pub(crate) fn bind(
    registry: &Arc<Proxy>,
    name: u32,
    interface: &'static Interface,
    version: u32,
    implementation: Arc<Implementation<Proxy>>,
) -> Result<Arc<Proxy>, BridgeError> {
    registry.marshal_constructor(
        WL_REGISTRY_BIND,
        &[
            Value::Uint(name),
            Value::Str(Some(interface.name.into())),
            Value::Uint(version),
            Value::NewId(0),
        ],
        interface,
        version,
        implementation,
    )
}

/// A bind handler creating a `test_global` resource with `implementation` for every bind
pub(crate) fn storing_handler(
    implementation: Arc<Implementation<Resource>>,
    store: Arc<Mutex<Vec<Arc<Resource>>>>,
) -> Arc<dyn GlobalHandler> {
    Arc::new(move |client: &Arc<server::Client>, version: u32, id: u32| -> Result<(), RequestError> {
        let resource =
            Resource::new(client, &TEST_GLOBAL_INTERFACE, version, id, implementation.clone())?;
        client.add_resource(&resource)?;
        store.lock().unwrap().push(resource);
        Ok(())
    })
}
