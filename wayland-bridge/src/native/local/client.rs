use std::{
    borrow::Cow,
    collections::{HashMap, VecDeque},
    os::unix::io::{IntoRawFd, OwnedFd, RawFd},
    sync::Arc,
};

use crate::{
    codec,
    core_interfaces::{WL_DISPLAY_DELETE_ID, WL_DISPLAY_ERROR, WL_DISPLAY_INTERFACE},
    native::{ClientLibrary, NativeDispatcher, ServerLibrary},
    protocol::{Argument, Interface, ProtocolError, SERVER_ID_LIMIT},
    types::{HandleKind, NativeError, NativeHandle},
};

use super::{
    dup_fd, handle, map::IdMap, ConnectionData, LocalLibrary, ProxyData, ProxySlot, QueuedEvent,
    State, WireArg, WireMessage,
};

/// The next step of event delivery on a connection
enum Delivery {
    Dispatch(Arc<dyn NativeDispatcher>, NativeHandle, u32, Vec<Argument<'static>>),
    Skip,
    Empty,
}

fn broken_pipe() -> NativeError {
    std::io::Error::from(std::io::ErrorKind::BrokenPipe).into()
}

impl State {
    /// Move the events sent by the server to the queue of their target
    ///
    /// Proxies introduced by an event are created here, on the queue of the event's target, so
    /// that later events can reach them whatever queue they are dispatched from.
    fn sort_events(
        &mut self,
        connection: usize,
        alloc: &dyn Fn() -> NativeHandle,
    ) -> Result<(), NativeError> {
        let State { connections, proxies, .. } = self;
        let data = connections.get_mut(&connection).ok_or(NativeError::InvalidObject)?;
        while let Some(message) = data.events.pop_front() {
            let sender = match data.objects.find(message.sender_id) {
                Some(ProxySlot::Live(proxy)) => *proxy,
                Some(ProxySlot::Zombie) => continue,
                None => {
                    crate::log_warn!("Event {} for unknown object {}", message.opcode, message.sender_id);
                    continue;
                }
            };
            let Some(proxy) = proxies.get(&sender) else {
                continue;
            };
            let (interface, version, queue) = (proxy.interface, proxy.version, proxy.queue);
            let child = interface.event(message.opcode).and_then(|desc| desc.child_interface);
            if let Some(child) = child.filter(|_| sender != connection) {
                for arg in &message.args {
                    let WireArg::NewId(id) = arg else {
                        continue;
                    };
                    let new_proxy = alloc();
                    match data.objects.insert_at(*id, ProxySlot::Live(new_proxy.addr())) {
                        Ok(()) => {
                            proxies.insert(
                                new_proxy.addr(),
                                ProxyData {
                                    connection,
                                    id: *id,
                                    interface: child,
                                    version,
                                    dispatcher: None,
                                    queue,
                                },
                            );
                        }
                        Err(_) => crate::log_error!("Server created object with invalid id {}", id),
                    }
                }
            }
            let event = QueuedEvent { sender, message };
            match queue.and_then(|queue| data.queues.get_mut(&queue)) {
                Some(events) => events.push_back(event),
                None => data.queued.push_back(event),
            }
        }
        Ok(())
    }

    /// Pop the next event of `queue`, the default queue if `None`
    fn next_event(&mut self, connection: usize, queue: Option<usize>) -> Result<Delivery, NativeError> {
        let State { connections, proxies, .. } = self;
        let data = connections.get_mut(&connection).ok_or(NativeError::InvalidObject)?;
        if let Some(err) = &data.error {
            return Err(NativeError::Protocol(err.clone()));
        }
        let pending = match queue {
            Some(queue) => data.queues.get_mut(&queue).ok_or(NativeError::InvalidObject)?,
            None => &mut data.queued,
        };
        let Some(QueuedEvent { sender, message }) = pending.pop_front() else {
            return Ok(Delivery::Empty);
        };

        if sender == connection {
            return match (message.opcode, message.args.as_slice()) {
                (WL_DISPLAY_ERROR, [WireArg::Object(object_id), WireArg::Uint(code), WireArg::Str(msg)]) => {
                    let object_interface = match data.objects.find(*object_id) {
                        Some(ProxySlot::Live(proxy)) => {
                            proxies.get(proxy).map_or("<unknown>", |p| p.interface.name)
                        }
                        _ => "<unknown>",
                    };
                    let err = ProtocolError {
                        code: *code,
                        object_id: *object_id,
                        object_interface: object_interface.into(),
                        message: msg.as_deref().map(codec::string_from_native).unwrap_or_default(),
                    };
                    data.error = Some(err.clone());
                    Err(NativeError::Protocol(err))
                }
                (WL_DISPLAY_DELETE_ID, [WireArg::Uint(id)]) => {
                    if let Some(ProxySlot::Zombie) = data.objects.find(*id) {
                        data.objects.remove(*id);
                    } else {
                        crate::log_warn!("Server deleted id {} which is still in use", id);
                    }
                    Ok(Delivery::Skip)
                }
                _ => {
                    crate::log_warn!("Unexpected wl_display event {}", message.opcode);
                    Ok(Delivery::Skip)
                }
            };
        }

        // destroyed since the event was sorted
        let Some(proxy) = proxies.get(&sender) else {
            return Ok(Delivery::Skip);
        };
        let interface = proxy.interface;
        let dispatcher = proxy.dispatcher.clone();
        let child = interface.event(message.opcode).and_then(|desc| desc.child_interface);

        let mut args = Vec::with_capacity(message.args.len());
        for arg in message.args {
            args.push(match arg {
                WireArg::Int(v) => Argument::Int(v),
                WireArg::Uint(v) => Argument::Uint(v),
                WireArg::Fixed(v) => Argument::Fixed(v),
                WireArg::Str(s) => Argument::Str(s.map(Cow::Owned)),
                WireArg::Object(id) => match data.objects.find(id) {
                    Some(ProxySlot::Live(proxy)) => {
                        Argument::Object(Some(handle(HandleKind::Proxy, *proxy)))
                    }
                    _ => Argument::Object(None),
                },
                WireArg::NewId(id) => match (child, data.objects.find(id)) {
                    (Some(_), Some(ProxySlot::Live(proxy))) => {
                        Argument::NewObject(handle(HandleKind::Proxy, *proxy))
                    }
                    _ => Argument::NewId(id),
                },
                WireArg::Array(bytes) => Argument::Array(Cow::Owned(bytes)),
                WireArg::Fd(fd) => Argument::Fd(fd.into_raw_fd()),
            });
        }

        match dispatcher {
            Some(dispatcher) => Ok(Delivery::Dispatch(
                dispatcher,
                handle(HandleKind::Proxy, sender),
                message.opcode,
                args,
            )),
            None => {
                crate::log_debug!("Event {} of {}@{} has no dispatcher", message.opcode, interface.name, message.sender_id);
                Ok(Delivery::Skip)
            }
        }
    }
}

impl LocalLibrary {
    fn connect(&self, display: usize) -> Result<NativeHandle, NativeError> {
        let connection = self.alloc(HandleKind::Connection);
        let client = self.create_client(display, Some(connection.addr()), None)?;
        let mut state = self.lock();
        let mut objects = IdMap::new();
        objects.client_insert_new(ProxySlot::Live(connection.addr()));
        state.connections.insert(
            connection.addr(),
            ConnectionData {
                objects,
                events: VecDeque::new(),
                queued: VecDeque::new(),
                queues: HashMap::new(),
                server_client: Some(client.addr()),
                error: None,
            },
        );
        state.proxies.insert(
            connection.addr(),
            ProxyData {
                connection: connection.addr(),
                id: 1,
                interface: &WL_DISPLAY_INTERFACE,
                version: 1,
                dispatcher: None,
                queue: None,
            },
        );
        Ok(connection)
    }

    fn dispatch_queued(
        &self,
        connection: NativeHandle,
        queue: Option<NativeHandle>,
    ) -> Result<usize, NativeError> {
        let alloc = || self.alloc(HandleKind::Proxy);
        let mut dispatched = 0;
        loop {
            let next = {
                let mut state = self.lock();
                state.sort_events(connection.addr(), &alloc)?;
                state.next_event(connection.addr(), queue.map(|queue| queue.addr()))?
            };
            match next {
                Delivery::Dispatch(dispatcher, target, opcode, args) => {
                    dispatcher.dispatch(target, opcode, &args);
                    dispatched += 1;
                }
                Delivery::Skip => {}
                Delivery::Empty => break,
            }
        }
        if dispatched == 0 {
            let disconnected =
                self.lock().connections.get(&connection.addr()).map_or(true, |c| c.server_client.is_none());
            if disconnected {
                return Err(broken_pipe());
            }
        }
        Ok(dispatched)
    }
}

impl ClientLibrary for LocalLibrary {
    fn display_connect(&self, name: Option<&str>) -> Result<NativeHandle, NativeError> {
        let name = match name {
            Some(name) => name.to_owned(),
            None => std::env::var("WAYLAND_DISPLAY").unwrap_or_else(|_| "wayland-0".into()),
        };
        let display = self.lock().sockets.get(&name).copied();
        match display {
            Some(display) => self.connect(display),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotFound).into()),
        }
    }

    fn display_connect_to_fd(&self, _fd: OwnedFd) -> Result<NativeHandle, NativeError> {
        Err(NativeError::Unsupported("connecting through a file descriptor"))
    }

    fn display_disconnect(&self, connection: NativeHandle) {
        let (server_client, removed) = {
            let mut state = self.lock();
            let Some(data) = state.connections.remove(&connection.addr()) else {
                return;
            };
            let proxies: Vec<usize> = state
                .proxies
                .iter()
                .filter(|(_, p)| p.connection == connection.addr())
                .map(|(addr, _)| *addr)
                .collect();
            let removed: Vec<ProxyData> =
                proxies.iter().filter_map(|p| state.proxies.remove(p)).collect();
            state.event_queues.retain(|_, owner| *owner != connection.addr());
            (data.server_client, (data, removed))
        };
        drop(removed);
        if let Some(client) = server_client {
            // the server sees the client hang up
            self.client_destroy(handle(HandleKind::Client, client));
        }
    }

    fn display_dispatch(&self, connection: NativeHandle) -> Result<usize, NativeError> {
        // no socket to block on, everything sent so far is already queued
        self.display_dispatch_pending(connection)
    }

    fn display_dispatch_pending(&self, connection: NativeHandle) -> Result<usize, NativeError> {
        self.dispatch_queued(connection, None)
    }

    fn display_flush(&self, connection: NativeHandle) -> Result<(), NativeError> {
        let state = self.lock();
        let data = state.connections.get(&connection.addr()).ok_or(NativeError::InvalidObject)?;
        match (&data.error, data.server_client) {
            (Some(err), _) => Err(NativeError::Protocol(err.clone())),
            (None, None) => Err(broken_pipe()),
            (None, Some(_)) => Ok(()),
        }
    }

    fn display_roundtrip(&self, connection: NativeHandle) -> Result<usize, NativeError> {
        let server_client = {
            let state = self.lock();
            let data = state.connections.get(&connection.addr()).ok_or(NativeError::InvalidObject)?;
            if let Some(err) = &data.error {
                return Err(NativeError::Protocol(err.clone()));
            }
            data.server_client
        };
        if let Some(client) = server_client {
            self.process_client(client);
        }
        self.display_dispatch_pending(connection)
    }

    fn display_protocol_error(&self, connection: NativeHandle) -> Option<ProtocolError> {
        self.lock().connections.get(&connection.addr())?.error.clone()
    }

    fn display_get_fd(&self, _connection: NativeHandle) -> Result<RawFd, NativeError> {
        Err(NativeError::Unsupported("connection file descriptor"))
    }

    fn display_create_queue(&self, connection: NativeHandle) -> Result<NativeHandle, NativeError> {
        let queue = self.alloc(HandleKind::EventQueue);
        let mut state = self.lock();
        let data = state.connections.get_mut(&connection.addr()).ok_or(NativeError::InvalidObject)?;
        data.queues.insert(queue.addr(), VecDeque::new());
        state.event_queues.insert(queue.addr(), connection.addr());
        Ok(queue)
    }

    fn display_dispatch_queue(
        &self,
        connection: NativeHandle,
        queue: NativeHandle,
    ) -> Result<usize, NativeError> {
        self.display_dispatch_queue_pending(connection, queue)
    }

    fn display_dispatch_queue_pending(
        &self,
        connection: NativeHandle,
        queue: NativeHandle,
    ) -> Result<usize, NativeError> {
        match self.lock().event_queues.get(&queue.addr()) {
            Some(owner) if *owner == connection.addr() => {}
            _ => return Err(NativeError::InvalidObject),
        }
        self.dispatch_queued(connection, Some(queue))
    }

    fn event_queue_destroy(&self, queue: NativeHandle) {
        let dropped = {
            let mut state = self.lock();
            let Some(connection) = state.event_queues.remove(&queue.addr()) else {
                return;
            };
            // the proxies left on the queue fall back to the default one
            for proxy in state.proxies.values_mut().filter(|p| p.queue == Some(queue.addr())) {
                proxy.queue = None;
            }
            state.connections.get_mut(&connection).and_then(|data| data.queues.remove(&queue.addr()))
        };
        if let Some(events) = dropped.filter(|events| !events.is_empty()) {
            crate::log_debug!("Dropping {} undispatched events of {}", events.len(), queue);
        }
    }

    fn proxy_marshal(
        &self,
        proxy: NativeHandle,
        opcode: u32,
        args: &[Argument<'_>],
        child: Option<(&'static Interface, u32)>,
    ) -> Result<Option<NativeHandle>, NativeError> {
        let new_proxy = self.alloc(HandleKind::Proxy);
        let mut state = self.lock();
        let sender = state.proxies.get(&proxy.addr()).ok_or(NativeError::InvalidObject)?;
        let (connection, sender_id, queue) = (sender.connection, sender.id, sender.queue);
        let data = state.connections.get(&connection).ok_or(NativeError::InvalidObject)?;
        if let Some(err) = &data.error {
            return Err(NativeError::Protocol(err.clone()));
        }
        let server_client = data.server_client.ok_or_else(broken_pipe)?;

        let object_id = |handle: NativeHandle| -> Result<u32, NativeError> {
            match state.proxies.get(&handle.addr()) {
                Some(p) if p.connection == connection => Ok(p.id),
                _ => Err(NativeError::InvalidObject),
            }
        };
        let mut wire = Vec::with_capacity(args.len());
        let mut new_id_index = None;
        for (index, arg) in args.iter().enumerate() {
            wire.push(match arg {
                Argument::Int(v) => WireArg::Int(*v),
                Argument::Uint(v) => WireArg::Uint(*v),
                Argument::Fixed(v) => WireArg::Fixed(*v),
                Argument::Str(s) => WireArg::Str(s.as_ref().map(|s| s.clone().into_owned())),
                Argument::Object(None) => WireArg::Object(0),
                Argument::Object(Some(h)) => WireArg::Object(object_id(*h)?),
                Argument::NewId(_) => {
                    new_id_index = Some(index);
                    WireArg::NewId(0)
                }
                Argument::NewObject(h) => WireArg::NewId(object_id(*h)?),
                Argument::Array(bytes) => WireArg::Array(bytes.to_vec()),
                Argument::Fd(fd) => WireArg::Fd(dup_fd(*fd)?),
            });
        }

        let created = match (new_id_index, child) {
            (Some(index), Some((interface, version))) => {
                let data = state.connections.get_mut(&connection).ok_or(NativeError::InvalidObject)?;
                let id = data.objects.client_insert_new(ProxySlot::Live(new_proxy.addr()));
                wire[index] = WireArg::NewId(id);
                state.proxies.insert(
                    new_proxy.addr(),
                    ProxyData { connection, id, interface, version, dispatcher: None, queue },
                );
                Some(new_proxy)
            }
            (Some(_), None) => return Err(NativeError::Unsupported("new_id without interface")),
            (None, _) => None,
        };

        if let Some(client) = state.clients.get_mut(&server_client) {
            client.requests.push_back(WireMessage { sender_id, opcode, args: wire });
        }
        Ok(created)
    }

    fn proxy_set_dispatcher(&self, proxy: NativeHandle, dispatcher: Arc<dyn NativeDispatcher>) {
        let old = match self.lock().proxies.get_mut(&proxy.addr()) {
            Some(data) => data.dispatcher.replace(dispatcher),
            None => Some(dispatcher),
        };
        drop(old);
    }

    fn proxy_set_queue(&self, proxy: NativeHandle, queue: Option<NativeHandle>) {
        let mut state = self.lock();
        let State { proxies, event_queues, .. } = &mut *state;
        let Some(data) = proxies.get_mut(&proxy.addr()) else {
            return;
        };
        match queue {
            Some(queue) if event_queues.get(&queue.addr()) != Some(&data.connection) => {
                crate::log_warn!("{} is not a queue of the connection of {}", queue, proxy);
            }
            _ => data.queue = queue.map(|queue| queue.addr()),
        }
    }

    fn proxy_destroy(&self, proxy: NativeHandle) {
        let removed = {
            let mut state = self.lock();
            match state.proxies.get(&proxy.addr()) {
                // the display object lives as long as the connection
                Some(data) if data.connection == proxy.addr() => return,
                None => return,
                Some(_) => {}
            }
            let data = state.proxies.remove(&proxy.addr());
            if let Some(data) = &data {
                if let Some(connection) = state.connections.get_mut(&data.connection) {
                    let owned = matches!(
                        connection.objects.find(data.id),
                        Some(ProxySlot::Live(addr)) if *addr == proxy.addr()
                    );
                    if owned {
                        if data.id < SERVER_ID_LIMIT {
                            if let Some(slot) = connection.objects.find_mut(data.id) {
                                *slot = ProxySlot::Zombie;
                            }
                        } else {
                            connection.objects.remove(data.id);
                        }
                    }
                }
            }
            data
        };
        drop(removed);
    }

    fn proxy_id(&self, proxy: NativeHandle) -> u32 {
        self.lock().proxies.get(&proxy.addr()).map_or(0, |p| p.id)
    }

    fn proxy_version(&self, proxy: NativeHandle) -> u32 {
        self.lock().proxies.get(&proxy.addr()).map_or(0, |p| p.version)
    }
}
