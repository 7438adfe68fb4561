use std::{
    borrow::Cow,
    collections::VecDeque,
    ffi::CStr,
    os::unix::io::{IntoRawFd, OwnedFd, RawFd},
    sync::Arc,
    time::Duration,
};

use crate::{
    codec,
    core_interfaces::{
        WL_CALLBACK_DONE, WL_CALLBACK_INTERFACE, WL_DISPLAY_DELETE_ID, WL_DISPLAY_ERROR,
        WL_DISPLAY_GET_REGISTRY, WL_DISPLAY_INTERFACE, WL_DISPLAY_SYNC, WL_REGISTRY_BIND,
        WL_REGISTRY_GLOBAL, WL_REGISTRY_GLOBAL_REMOVE, WL_REGISTRY_INTERFACE,
    },
    native::{
        BindHandler, DestroyNotify, FdMask, NativeDispatcher, ServerLibrary, SourceCallback,
    },
    protocol::{Argument, DisplayError, Interface, SERVER_ID_LIMIT},
    types::{HandleKind, ListenerToken, NativeError, NativeHandle},
};

use super::{
    dup_fd, handle, map::IdMap, ClientData, DisplayData, GlobalData, LocalLibrary, LoopData,
    PostedError, ResourceData, ResourceKind, State, WireArg, WireMessage,
};

/// Protocol id of the `wl_display` object of every client
const DISPLAY_ID: u32 = 1;

/// What a request asks the library to do once its lock is released
enum Action {
    Dispatch(Arc<dyn NativeDispatcher>, NativeHandle, u32, Vec<Argument<'static>>),
    Bind(Arc<dyn BindHandler>, NativeHandle, u32, u32),
}

fn wire_str(value: &str) -> WireArg {
    WireArg::Str(Some(codec::string_to_native(value).unwrap_or_default()))
}

impl State {
    /// Queue an event to the connection of a client
    fn queue_event(&mut self, client: usize, sender_id: u32, opcode: u32, args: Vec<WireArg>) {
        let Some(data) = self.clients.get(&client) else {
            return;
        };
        if data.errored {
            return;
        }
        let Some(connection) = data.connection.and_then(|c| self.connections.get_mut(&c)) else {
            return;
        };
        connection.events.push_back(WireMessage { sender_id, opcode, args });
    }

    /// Send `wl_display.error`, the client is destroyed at the end of the current processing pass
    fn post_error(&mut self, client: usize, object_id: u32, code: u32, message: String) {
        match self.clients.get(&client) {
            Some(data) if !data.errored => {}
            _ => return,
        }
        crate::log_debug!("Protocol error {} on object {}: {}", code, object_id, message);
        self.queue_event(
            client,
            DISPLAY_ID,
            WL_DISPLAY_ERROR,
            vec![WireArg::Object(object_id), WireArg::Uint(code), wire_str(&message)],
        );
        if let Some(data) = self.clients.get_mut(&client) {
            data.errored = true;
        }
        self.posted_errors.insert(client, PostedError { object_id, code, message });
    }

    fn create_resource(
        &mut self,
        addr: usize,
        client: usize,
        interface: &'static Interface,
        version: u32,
        id: u32,
        kind: ResourceKind,
    ) -> Result<u32, NativeError> {
        let data = self.clients.get_mut(&client).ok_or(NativeError::InvalidObject)?;
        let id = if id == 0 {
            data.objects.server_insert_new(addr)
        } else {
            data.objects.insert_at(id, addr).map_err(|_| NativeError::InvalidObject)?;
            id
        };
        self.resources.insert(addr, ResourceData { client, id, interface, version, kind });
        Ok(id)
    }

    /// Forget a resource whose destroy signal already fired
    fn remove_resource(&mut self, addr: usize) -> Option<ResourceData> {
        let data = self.resources.remove(&addr)?;
        let mut release_id = false;
        if let Some(client) = self.clients.get_mut(&data.client) {
            client.objects.remove(data.id);
            release_id = !client.destroying && data.id < SERVER_ID_LIMIT;
        }
        if release_id {
            self.queue_event(data.client, DISPLAY_ID, WL_DISPLAY_DELETE_ID, vec![WireArg::Uint(data.id)]);
        }
        Some(data)
    }

    fn encode_event(&self, client: usize, args: &[Argument<'_>]) -> Result<Vec<WireArg>, String> {
        let object_id = |handle: NativeHandle| -> Result<u32, String> {
            match self.resources.get(&handle.addr()) {
                Some(res) if res.client == client => Ok(res.id),
                _ => Err(format!("object {handle} does not belong to the client")),
            }
        };
        let mut wire = Vec::with_capacity(args.len());
        for arg in args {
            wire.push(match arg {
                Argument::Int(v) => WireArg::Int(*v),
                Argument::Uint(v) => WireArg::Uint(*v),
                Argument::Fixed(v) => WireArg::Fixed(*v),
                Argument::Str(s) => WireArg::Str(s.as_ref().map(|s| s.clone().into_owned())),
                Argument::Object(None) => WireArg::Object(0),
                Argument::Object(Some(h)) => WireArg::Object(object_id(*h)?),
                Argument::NewId(id) => WireArg::NewId(*id),
                Argument::NewObject(h) => WireArg::NewId(object_id(*h)?),
                Argument::Array(data) => WireArg::Array(data.to_vec()),
                Argument::Fd(fd) => WireArg::Fd(dup_fd(*fd).map_err(|e| e.to_string())?),
            });
        }
        Ok(wire)
    }

    /// Translate the arguments of a request, the handler takes ownership of the file descriptors
    fn decode_request(
        &self,
        client: &ClientData,
        args: Vec<WireArg>,
    ) -> Result<Vec<Argument<'static>>, u32> {
        let mut decoded = Vec::with_capacity(args.len());
        for arg in args {
            decoded.push(match arg {
                WireArg::Int(v) => Argument::Int(v),
                WireArg::Uint(v) => Argument::Uint(v),
                WireArg::Fixed(v) => Argument::Fixed(v),
                WireArg::Str(s) => Argument::Str(s.map(Cow::Owned)),
                WireArg::Object(0) => Argument::Object(None),
                WireArg::Object(id) => match client.objects.find(id) {
                    Some(&addr) => Argument::Object(Some(handle(HandleKind::Resource, addr))),
                    None => return Err(id),
                },
                WireArg::NewId(id) => Argument::NewId(id),
                WireArg::Array(data) => Argument::Array(Cow::Owned(data)),
                WireArg::Fd(fd) => Argument::Fd(fd.into_raw_fd()),
            });
        }
        Ok(decoded)
    }

    fn send_globals(&mut self, client: usize, registry_id: u32) {
        let Some(display) = self.clients.get(&client).and_then(|c| self.displays.get(&c.display))
        else {
            return;
        };
        let announces: Vec<_> = display
            .globals
            .iter()
            .filter_map(|g| self.globals.get(g))
            .map(|g| (g.name, g.interface.name, g.version))
            .collect();
        for (name, interface, version) in announces {
            self.queue_event(
                client,
                registry_id,
                WL_REGISTRY_GLOBAL,
                vec![WireArg::Uint(name), wire_str(interface), WireArg::Uint(version)],
            );
        }
    }

    /// Send an event to every registry of a display
    fn broadcast_registry(&mut self, display: usize, opcode: u32, args: impl Fn() -> Vec<WireArg>) {
        let targets: Vec<(usize, u32)> = self
            .resources
            .values()
            .filter(|res| matches!(res.kind, ResourceKind::Registry))
            .filter(|res| self.clients.get(&res.client).map_or(false, |c| c.display == display))
            .map(|res| (res.client, res.id))
            .collect();
        for (client, id) in targets {
            self.queue_event(client, id, opcode, args());
        }
    }
}

impl LocalLibrary {
    pub(super) fn create_client(
        &self,
        display: usize,
        connection: Option<usize>,
        socket: Option<OwnedFd>,
    ) -> Result<NativeHandle, NativeError> {
        let client = self.alloc(HandleKind::Client);
        let display_resource = self.alloc(HandleKind::Resource);
        let mut state = self.lock();
        let display_data = state.displays.get_mut(&display).ok_or(NativeError::InvalidObject)?;
        display_data.clients.push(client.addr());
        state.clients.insert(
            client.addr(),
            ClientData {
                display,
                objects: IdMap::new(),
                requests: VecDeque::new(),
                connection,
                errored: false,
                destroying: false,
                _socket: socket,
            },
        );
        state.create_resource(
            display_resource.addr(),
            client.addr(),
            &WL_DISPLAY_INTERFACE,
            1,
            DISPLAY_ID,
            ResourceKind::Display,
        )?;
        Ok(client)
    }

    /// Handle the pending requests of a client
    pub(super) fn process_client(&self, client: usize) {
        loop {
            let message = {
                let mut state = self.lock();
                let Some(data) = state.clients.get_mut(&client) else {
                    return;
                };
                if data.errored {
                    data.requests.clear();
                    None
                } else {
                    data.requests.pop_front()
                }
            };
            let Some(message) = message else {
                break;
            };
            let action = self.route_request(client, message);
            match action {
                Some(Action::Dispatch(dispatcher, target, opcode, args)) => {
                    if dispatcher.dispatch(target, opcode, &args) < 0 {
                        crate::log_debug!("Dispatcher of {} failed on opcode {}", target, opcode);
                    }
                }
                Some(Action::Bind(handler, global, version, id)) => {
                    handler.bind(global, handle(HandleKind::Client, client), version, id)
                }
                None => {}
            }
        }
        let errored = self.lock().clients.get(&client).map_or(false, |c| c.errored);
        if errored {
            self.client_destroy(handle(HandleKind::Client, client));
        }
    }

    /// Handle the pending requests of every client whose display runs on `event_loop`
    pub(super) fn process_clients(&self, event_loop: usize) -> bool {
        let clients: Vec<(usize, bool)> = {
            let state = self.lock();
            state
                .displays
                .values()
                .filter(|d| d.event_loop == event_loop)
                .flat_map(|d| d.clients.iter())
                .filter_map(|c| state.clients.get(c).map(|data| (*c, data)))
                .map(|(c, data)| (c, !data.requests.is_empty() || data.errored))
                .collect()
        };
        let mut processed = false;
        for (client, pending) in clients {
            if pending {
                processed = true;
                self.process_client(client);
            }
        }
        processed
    }

    fn route_request(&self, client: usize, message: WireMessage) -> Option<Action> {
        let callback_addr = self.alloc(HandleKind::Resource).addr();
        let mut state = self.lock();
        let sender = message.sender_id;
        let Some(&target) = state.clients.get(&client)?.objects.find(sender) else {
            state.post_error(
                client,
                DISPLAY_ID,
                DisplayError::InvalidObject as u32,
                format!("invalid object {sender}"),
            );
            return None;
        };
        let resource = state.resources.get(&target)?;
        let interface = resource.interface;
        let invalid_method = format!("invalid method {}, object {}@{}", message.opcode, interface.name, sender);

        match &resource.kind {
            ResourceKind::Display => match (message.opcode, message.args.as_slice()) {
                (WL_DISPLAY_SYNC, [WireArg::NewId(id)]) => {
                    let id = *id;
                    if let Err(err) = state.create_resource(
                        callback_addr,
                        client,
                        &WL_CALLBACK_INTERFACE,
                        1,
                        id,
                        ResourceKind::Callback,
                    ) {
                        state.post_error(client, DISPLAY_ID, DisplayError::InvalidObject as u32, format!("invalid new id {id}: {err}"));
                        return None;
                    }
                    let serial = state.clients.get(&client).and_then(|c| state.displays.get(&c.display)).map_or(0, |d| d.serial);
                    state.queue_event(client, id, WL_CALLBACK_DONE, vec![WireArg::Uint(serial)]);
                    state.remove_resource(callback_addr);
                    None
                }
                (WL_DISPLAY_GET_REGISTRY, [WireArg::NewId(id)]) => {
                    let id = *id;
                    if let Err(err) = state.create_resource(
                        callback_addr,
                        client,
                        &WL_REGISTRY_INTERFACE,
                        1,
                        id,
                        ResourceKind::Registry,
                    ) {
                        state.post_error(client, DISPLAY_ID, DisplayError::InvalidObject as u32, format!("invalid new id {id}: {err}"));
                        return None;
                    }
                    state.send_globals(client, id);
                    None
                }
                _ => {
                    state.post_error(client, sender, DisplayError::InvalidMethod as u32, invalid_method);
                    None
                }
            },
            ResourceKind::Registry => match (message.opcode, message.args.as_slice()) {
                (
                    WL_REGISTRY_BIND,
                    [WireArg::Uint(name), WireArg::Str(Some(requested)), WireArg::Uint(bind_version), WireArg::NewId(id)],
                ) => {
                    let requested = codec::string_from_native(requested);
                    let (name, bind_version, id) = (*name, *bind_version, *id);
                    let display = state.clients.get(&client)?.display;
                    let found = state
                        .displays
                        .get(&display)
                        .into_iter()
                        .flat_map(|d| d.globals.iter())
                        .filter_map(|g| state.globals.get(g).map(|data| (*g, data)))
                        .find(|(_, data)| data.name == name)
                        .map(|(g, data)| (g, data.interface.name, data.version, data.handler.clone()));
                    let Some((global, global_interface, global_version, handler)) = found else {
                        let msg = format!("invalid global {requested} ({name})");
                        state.post_error(client, sender, DisplayError::InvalidObject as u32, msg);
                        return None;
                    };
                    if global_interface != requested {
                        let msg = format!(
                            "invalid interface for global {name}: have {global_interface}, wanted {requested}"
                        );
                        state.post_error(client, sender, DisplayError::InvalidObject as u32, msg);
                        return None;
                    }
                    if bind_version == 0 || bind_version > global_version {
                        let msg = format!(
                            "invalid version for global {requested} ({name}): have {global_version}, wanted {bind_version}"
                        );
                        state.post_error(client, sender, DisplayError::InvalidObject as u32, msg);
                        return None;
                    }
                    Some(Action::Bind(handler, handle(HandleKind::Global, global), bind_version, id))
                }
                _ => {
                    state.post_error(client, sender, DisplayError::InvalidMethod as u32, invalid_method);
                    None
                }
            },
            ResourceKind::Callback => {
                state.post_error(client, sender, DisplayError::InvalidMethod as u32, invalid_method);
                None
            }
            ResourceKind::Managed(None) => {
                let msg = format!("{}@{} has no implementation", interface.name, sender);
                state.post_error(client, sender, DisplayError::InvalidMethod as u32, msg);
                None
            }
            ResourceKind::Managed(Some(dispatcher)) => {
                let dispatcher = dispatcher.clone();
                let data = state.clients.get(&client)?;
                match state.decode_request(data, message.args) {
                    Ok(args) => Some(Action::Dispatch(
                        dispatcher,
                        handle(HandleKind::Resource, target),
                        message.opcode,
                        args,
                    )),
                    Err(id) => {
                        let msg = format!("unknown object ({}), message {}@{}#{}", id, interface.name, sender, message.opcode);
                        state.post_error(client, DISPLAY_ID, DisplayError::InvalidObject as u32, msg);
                        None
                    }
                }
            }
        }
    }
}

impl ServerLibrary for LocalLibrary {
    fn display_create(&self) -> Result<NativeHandle, NativeError> {
        let display = self.alloc(HandleKind::Display);
        let event_loop = self.alloc(HandleKind::EventLoop);
        let mut state = self.lock();
        state
            .loops
            .insert(event_loop.addr(), LoopData { display: Some(display.addr()), sources: Vec::new() });
        state.displays.insert(
            display.addr(),
            DisplayData {
                event_loop: event_loop.addr(),
                clients: Vec::new(),
                globals: Vec::new(),
                sockets: Vec::new(),
                serial: 0,
                next_global_name: 1,
                terminated: false,
            },
        );
        Ok(display)
    }

    fn display_destroy(&self, display: NativeHandle) {
        let clients = match self.lock().displays.get(&display.addr()) {
            Some(data) => data.clients.clone(),
            None => return,
        };
        for client in clients {
            self.client_destroy(handle(HandleKind::Client, client));
        }
        self.emit_destroy(display);

        let event_loop = self.lock().displays.get(&display.addr()).map(|d| d.event_loop);
        if let Some(event_loop) = event_loop {
            self.destroy_loop(event_loop);
        }

        let removed = {
            let mut state = self.lock();
            let data = state.displays.remove(&display.addr());
            let mut globals = Vec::new();
            if let Some(data) = &data {
                for socket in &data.sockets {
                    state.sockets.remove(socket);
                }
                for global in &data.globals {
                    globals.extend(state.globals.remove(global));
                }
            }
            (data, globals)
        };
        drop(removed);
    }

    fn display_event_loop(&self, display: NativeHandle) -> NativeHandle {
        match self.lock().displays.get(&display.addr()) {
            Some(data) => handle(HandleKind::EventLoop, data.event_loop),
            None => {
                crate::log_warn!("Event loop of unknown display {}", display);
                display.with_kind(HandleKind::EventLoop)
            }
        }
    }

    fn display_add_socket(
        &self,
        display: NativeHandle,
        name: Option<&str>,
    ) -> Result<String, NativeError> {
        let mut state = self.lock();
        if !state.displays.contains_key(&display.addr()) {
            return Err(NativeError::InvalidObject);
        }
        let name = match name {
            Some(name) if state.sockets.contains_key(name) => {
                return Err(std::io::Error::from(std::io::ErrorKind::AddrInUse).into())
            }
            Some(name) => name.to_owned(),
            None => (0..32)
                .map(|n| format!("wayland-{n}"))
                .find(|name| !state.sockets.contains_key(name))
                .ok_or_else(|| NativeError::from(std::io::Error::from(std::io::ErrorKind::AddrInUse)))?,
        };
        state.sockets.insert(name.clone(), display.addr());
        if let Some(data) = state.displays.get_mut(&display.addr()) {
            data.sockets.push(name.clone());
        }
        Ok(name)
    }

    fn display_terminate(&self, display: NativeHandle) {
        if let Some(data) = self.lock().displays.get_mut(&display.addr()) {
            data.terminated = true;
        }
    }

    fn display_run(&self, display: NativeHandle) {
        let event_loop = {
            let mut state = self.lock();
            let Some(data) = state.displays.get_mut(&display.addr()) else {
                return;
            };
            data.terminated = false;
            handle(HandleKind::EventLoop, data.event_loop)
        };
        loop {
            let running = self.lock().displays.get(&display.addr()).map_or(false, |d| !d.terminated);
            if !running {
                break;
            }
            if let Err(err) = self.event_loop_dispatch(event_loop, None) {
                crate::log_error!("Event loop dispatch failed: {}", err);
                break;
            }
            std::thread::yield_now();
        }
    }

    fn display_flush_clients(&self, _display: NativeHandle) {
        // events are delivered to the connections as they are posted
    }

    fn display_serial(&self, display: NativeHandle) -> u32 {
        self.lock().displays.get(&display.addr()).map_or(0, |d| d.serial)
    }

    fn display_next_serial(&self, display: NativeHandle) -> u32 {
        match self.lock().displays.get_mut(&display.addr()) {
            Some(data) => {
                data.serial = data.serial.wrapping_add(1);
                data.serial
            }
            None => 0,
        }
    }

    fn client_create(&self, display: NativeHandle, fd: OwnedFd) -> Result<NativeHandle, NativeError> {
        let stat = rustix::fs::fstat(&fd)?;
        if rustix::fs::FileType::from_raw_mode(stat.st_mode as _) != rustix::fs::FileType::Socket {
            return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput).into());
        }
        self.create_client(display.addr(), None, Some(fd))
    }

    fn client_destroy(&self, client: NativeHandle) {
        {
            let mut state = self.lock();
            match state.clients.get_mut(&client.addr()) {
                Some(data) if !data.destroying => data.destroying = true,
                _ => return,
            }
        }
        self.emit_destroy(client);

        let resources: Vec<usize> = match self.lock().clients.get(&client.addr()) {
            Some(data) => data.objects.iter().map(|(_, &addr)| addr).collect(),
            None => Vec::new(),
        };
        for resource in resources {
            self.resource_destroy(handle(HandleKind::Resource, resource));
        }

        let removed = {
            let mut state = self.lock();
            let data = state.clients.remove(&client.addr());
            if let Some(data) = &data {
                if let Some(display) = state.displays.get_mut(&data.display) {
                    display.clients.retain(|&c| c != client.addr());
                }
                if let Some(connection) = data.connection.and_then(|c| state.connections.get_mut(&c)) {
                    connection.server_client = None;
                }
            }
            data
        };
        drop(removed);
    }

    fn client_flush(&self, _client: NativeHandle) {}

    fn client_display(&self, client: NativeHandle) -> NativeHandle {
        match self.lock().clients.get(&client.addr()) {
            Some(data) => handle(HandleKind::Display, data.display),
            None => client.with_kind(HandleKind::Display),
        }
    }

    fn client_post_no_memory(&self, client: NativeHandle) {
        self.lock().post_error(
            client.addr(),
            DISPLAY_ID,
            DisplayError::NoMemory as u32,
            "no memory".into(),
        );
    }

    fn client_post_error(&self, client: NativeHandle, code: u32, message: &CStr) {
        self.lock().post_error(client.addr(), DISPLAY_ID, code, codec::error_message_text(message));
    }

    fn resource_create(
        &self,
        client: NativeHandle,
        interface: &'static Interface,
        version: u32,
        id: u32,
    ) -> Result<NativeHandle, NativeError> {
        let resource = self.alloc(HandleKind::Resource);
        self.lock().create_resource(
            resource.addr(),
            client.addr(),
            interface,
            version,
            id,
            ResourceKind::Managed(None),
        )?;
        Ok(resource)
    }

    fn resource_set_dispatcher(&self, resource: NativeHandle, dispatcher: Arc<dyn NativeDispatcher>) {
        let old = match self.lock().resources.get_mut(&resource.addr()) {
            Some(data) => std::mem::replace(&mut data.kind, ResourceKind::Managed(Some(dispatcher))),
            None => ResourceKind::Managed(Some(dispatcher)),
        };
        drop(old);
    }

    fn resource_destroy(&self, resource: NativeHandle) {
        if !self.is_alive(resource) {
            return;
        }
        self.emit_destroy(resource);
        let removed = self.lock().remove_resource(resource.addr());
        drop(removed);
    }

    fn resource_client(&self, resource: NativeHandle) -> NativeHandle {
        match self.lock().resources.get(&resource.addr()) {
            Some(data) => handle(HandleKind::Client, data.client),
            None => resource.with_kind(HandleKind::Client),
        }
    }

    fn resource_id(&self, resource: NativeHandle) -> u32 {
        self.lock().resources.get(&resource.addr()).map_or(0, |r| r.id)
    }

    fn resource_version(&self, resource: NativeHandle) -> u32 {
        self.lock().resources.get(&resource.addr()).map_or(0, |r| r.version)
    }

    fn resource_post_event(&self, resource: NativeHandle, opcode: u32, args: &[Argument<'_>]) {
        let mut state = self.lock();
        let Some(data) = state.resources.get(&resource.addr()) else {
            crate::log_warn!("Event {} sent to dead resource {}", opcode, resource);
            return;
        };
        let (client, id) = (data.client, data.id);
        match state.encode_event(client, args) {
            Ok(wire) => state.queue_event(client, id, opcode, wire),
            Err(msg) => crate::log_error!("Cannot send event {} of {}: {}", opcode, resource, msg),
        }
    }

    fn resource_post_error(&self, resource: NativeHandle, code: u32, message: &CStr) {
        let mut state = self.lock();
        let Some(data) = state.resources.get(&resource.addr()) else {
            return;
        };
        let (client, id) = (data.client, data.id);
        state.post_error(client, id, code, codec::error_message_text(message));
    }

    fn resource_post_no_memory(&self, resource: NativeHandle) {
        let mut state = self.lock();
        let Some(client) = state.resources.get(&resource.addr()).map(|r| r.client) else {
            return;
        };
        state.post_error(client, DISPLAY_ID, DisplayError::NoMemory as u32, "no memory".into());
    }

    fn add_destroy_listener(
        &self,
        object: NativeHandle,
        notify: DestroyNotify,
    ) -> Result<ListenerToken, NativeError> {
        self.add_listener(object, notify)
    }

    fn remove_destroy_listener(&self, token: ListenerToken) {
        self.remove_listener(token)
    }

    fn global_create(
        &self,
        display: NativeHandle,
        interface: &'static Interface,
        version: u32,
        handler: Arc<dyn BindHandler>,
    ) -> Result<NativeHandle, NativeError> {
        let global = self.alloc(HandleKind::Global);
        let mut state = self.lock();
        let data = state.displays.get_mut(&display.addr()).ok_or(NativeError::InvalidObject)?;
        let name = data.next_global_name;
        data.next_global_name += 1;
        data.globals.push(global.addr());
        state.globals.insert(
            global.addr(),
            GlobalData { display: display.addr(), name, interface, version, handler },
        );
        state.broadcast_registry(display.addr(), WL_REGISTRY_GLOBAL, || {
            vec![WireArg::Uint(name), wire_str(interface.name), WireArg::Uint(version)]
        });
        Ok(global)
    }

    fn global_destroy(&self, global: NativeHandle) {
        let removed = {
            let mut state = self.lock();
            let Some(data) = state.globals.remove(&global.addr()) else {
                return;
            };
            if let Some(display) = state.displays.get_mut(&data.display) {
                display.globals.retain(|&g| g != global.addr());
            }
            let name = data.name;
            state.broadcast_registry(data.display, WL_REGISTRY_GLOBAL_REMOVE, || {
                vec![WireArg::Uint(name)]
            });
            data
        };
        drop(removed);
    }

    fn event_loop_create(&self) -> Result<NativeHandle, NativeError> {
        let event_loop = self.alloc(HandleKind::EventLoop);
        self.lock().loops.insert(event_loop.addr(), LoopData { display: None, sources: Vec::new() });
        Ok(event_loop)
    }

    fn event_loop_destroy(&self, event_loop: NativeHandle) {
        let standalone = self.lock().loops.get(&event_loop.addr()).map(|l| l.display.is_none());
        match standalone {
            Some(true) => self.destroy_loop(event_loop.addr()),
            Some(false) => {
                crate::log_warn!("The event loop of a display is destroyed with its display")
            }
            None => {}
        }
    }

    fn event_loop_fd(&self, _event_loop: NativeHandle) -> Result<RawFd, NativeError> {
        Err(NativeError::Unsupported("event loop file descriptor"))
    }

    fn event_loop_add_fd(
        &self,
        event_loop: NativeHandle,
        fd: RawFd,
        mask: FdMask,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        self.add_source(event_loop, super::SourceKind::Fd { fd, mask }, callback)
    }

    fn event_loop_add_timer(
        &self,
        event_loop: NativeHandle,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        self.add_source(event_loop, super::SourceKind::Timer { deadline: None }, callback)
    }

    fn event_loop_add_signal(
        &self,
        _event_loop: NativeHandle,
        _signal: i32,
        _callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        Err(NativeError::Unsupported("signal sources"))
    }

    fn event_loop_add_idle(
        &self,
        event_loop: NativeHandle,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        self.add_source(event_loop, super::SourceKind::Idle, callback)
    }

    fn event_source_fd_update(&self, source: NativeHandle, mask: FdMask) -> Result<(), NativeError> {
        match self.lock().sources.get_mut(&source.addr()).map(|s| &mut s.kind) {
            Some(super::SourceKind::Fd { mask: current, .. }) => {
                *current = mask;
                Ok(())
            }
            _ => Err(NativeError::InvalidObject),
        }
    }

    fn event_source_timer_update(&self, source: NativeHandle, ms: u32) -> Result<(), NativeError> {
        match self.lock().sources.get_mut(&source.addr()).map(|s| &mut s.kind) {
            Some(super::SourceKind::Timer { deadline }) => {
                *deadline = (ms > 0)
                    .then(|| std::time::Instant::now() + Duration::from_millis(u64::from(ms)));
                Ok(())
            }
            _ => Err(NativeError::InvalidObject),
        }
    }

    fn event_source_remove(&self, source: NativeHandle) {
        let removed = self.remove_source(source.addr());
        drop(removed);
    }

    fn event_source_check(&self, source: NativeHandle) {
        if let Some(data) = self.lock().sources.get_mut(&source.addr()) {
            data.check = true;
        }
    }

    fn event_loop_dispatch(
        &self,
        event_loop: NativeHandle,
        timeout: Option<Duration>,
    ) -> Result<(), NativeError> {
        self.dispatch_loop(event_loop.addr(), timeout)
    }

    fn event_loop_dispatch_idle(&self, event_loop: NativeHandle) {
        self.dispatch_idle(event_loop.addr());
    }
}
