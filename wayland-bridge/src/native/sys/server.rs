//! [`ServerLibrary`] over `libwayland-server`

use std::{
    collections::{HashMap, HashSet},
    ffi::{CStr, CString},
    fmt,
    os::{
        raw::{c_int, c_void},
        unix::io::{IntoRawFd, OwnedFd, RawFd},
    },
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use wayland_sys::{
    common::{wl_argument, wl_message},
    ffi_dispatch,
    server::*,
};

use crate::{
    dispatch::panic_message,
    native::{
        BindHandler, DestroyNotify, FdMask, NativeDispatcher, ServerLibrary, SourceCallback,
        SourceEvent,
    },
    protocol::{Argument, Interface},
    types::{HandleKind, ListenerToken, NativeError, NativeHandle},
};

use super::{c_interface, read_arguments, rust_managed, ArgumentList};

#[cfg(feature = "log")]
extern "C" {
    fn wl_log_trampoline_to_rust_server(fmt: *const std::os::raw::c_char, list: *const c_void);
}

fn handle<T>(kind: HandleKind, ptr: *mut T) -> Result<NativeHandle, NativeError> {
    NativeHandle::from_ptr(kind, ptr).ok_or(NativeError::NoMemory)
}

fn last_os_error() -> NativeError {
    NativeError::Io(std::io::Error::last_os_error())
}

struct ListenerData {
    notify: DestroyNotify,
    object: NativeHandle,
    live: Arc<Mutex<HashSet<usize>>>,
}

struct GlobalData {
    handler: Arc<dyn BindHandler>,
    global: usize,
}

struct SourceData {
    callback: SourceCallback,
    source: usize,
    /// Only set for idle sources, which libwayland frees once they ran
    table: Option<Arc<Mutex<SourceTable>>>,
}

#[derive(Default)]
struct SourceTable {
    /// source -> (event loop, boxed `SourceData`)
    sources: HashMap<usize, (usize, usize)>,
}

#[derive(Default)]
struct State {
    /// global -> (display, boxed `GlobalData`)
    globals: HashMap<usize, (usize, usize)>,
}

/// The server side of the system `libwayland`
pub struct SystemServer {
    state: Mutex<State>,
    listeners: Arc<Mutex<HashSet<usize>>>,
    sources: Arc<Mutex<SourceTable>>,
}

impl SystemServer {
    /// Load `libwayland-server`
    ///
    /// Fails with [`NativeError::NoWaylandLib`] if the library is loaded at runtime and could not
    /// be found.
    pub fn load() -> Result<Self, NativeError> {
        if !is_lib_available() {
            return Err(NativeError::NoWaylandLib);
        }
        #[cfg(feature = "log")]
        unsafe {
            ffi_dispatch!(
                wayland_server_handle(),
                wl_log_set_handler_server,
                wl_log_trampoline_to_rust_server
            )
        };
        Ok(Self {
            state: Mutex::new(State::default()),
            listeners: Arc::new(Mutex::new(HashSet::new())),
            sources: Arc::new(Mutex::new(SourceTable::default())),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sources(&self) -> MutexGuard<'_, SourceTable> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_source<F>(
        &self,
        event_loop: NativeHandle,
        callback: SourceCallback,
        idle: bool,
        create: F,
    ) -> Result<NativeHandle, NativeError>
    where
        F: FnOnce(*mut c_void) -> *mut wl_event_source,
    {
        let table = if idle { Some(self.sources.clone()) } else { None };
        let data = Box::into_raw(Box::new(SourceData { callback, source: 0, table }));
        let source = create(data as *mut c_void);
        if source.is_null() {
            // Safety: the library did not keep the pointer
            drop(unsafe { Box::from_raw(data) });
            return Err(last_os_error());
        }
        // Safety: the source cannot fire before the loop is dispatched
        unsafe { (*data).source = source as usize };
        self.lock_sources().sources.insert(source as usize, (event_loop.addr(), data as usize));
        handle(HandleKind::EventSource, source)
    }
}

impl fmt::Debug for SystemServer {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemServer")
            .field("globals", &self.lock().globals.len())
            .field("sources", &self.lock_sources().sources.len())
            .finish_non_exhaustive()
    }
}

impl ServerLibrary for SystemServer {
    fn display_create(&self) -> Result<NativeHandle, NativeError> {
        let display = unsafe { ffi_dispatch!(wayland_server_handle(), wl_display_create) };
        handle(HandleKind::Display, display)
    }

    fn display_destroy(&self, display: NativeHandle) {
        let ptr = display.as_ptr::<wl_display>();
        let event_loop = self.display_event_loop(display);
        unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_display_destroy_clients, ptr);
            ffi_dispatch!(wayland_server_handle(), wl_display_destroy, ptr);
        }
        // libwayland destroyed the remaining globals and sources with the display
        let globals: Vec<usize> = {
            let mut state = self.lock();
            let dead: Vec<usize> = state
                .globals
                .iter()
                .filter(|(_, (owner, _))| *owner == display.addr())
                .map(|(global, _)| *global)
                .collect();
            dead.into_iter().filter_map(|global| state.globals.remove(&global)).map(|(_, data)| data).collect()
        };
        for data in globals {
            drop(unsafe { Box::from_raw(data as *mut GlobalData) });
        }
        free_sources(&self.sources, event_loop.addr());
    }

    fn display_event_loop(&self, display: NativeHandle) -> NativeHandle {
        let event_loop = unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_display_get_event_loop, display.as_ptr())
        };
        NativeHandle::from_raw_parts(HandleKind::EventLoop, event_loop as usize)
    }

    fn display_add_socket(
        &self,
        display: NativeHandle,
        name: Option<&str>,
    ) -> Result<String, NativeError> {
        match name {
            Some(name) => {
                let cname = CString::new(name).map_err(|_| {
                    NativeError::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput))
                })?;
                let ret = unsafe {
                    ffi_dispatch!(
                        wayland_server_handle(),
                        wl_display_add_socket,
                        display.as_ptr(),
                        cname.as_ptr()
                    )
                };
                if ret < 0 {
                    return Err(last_os_error());
                }
                Ok(name.to_owned())
            }
            None => {
                let name = unsafe {
                    ffi_dispatch!(wayland_server_handle(), wl_display_add_socket_auto, display.as_ptr())
                };
                if name.is_null() {
                    return Err(last_os_error());
                }
                Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
            }
        }
    }

    fn display_terminate(&self, display: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_display_terminate, display.as_ptr()) }
    }

    fn display_run(&self, display: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_display_run, display.as_ptr()) }
    }

    fn display_flush_clients(&self, display: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_display_flush_clients, display.as_ptr()) }
    }

    fn display_serial(&self, display: NativeHandle) -> u32 {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_display_get_serial, display.as_ptr()) }
    }

    fn display_next_serial(&self, display: NativeHandle) -> u32 {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_display_next_serial, display.as_ptr()) }
    }

    fn client_create(&self, display: NativeHandle, fd: OwnedFd) -> Result<NativeHandle, NativeError> {
        let client = unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_client_create, display.as_ptr(), fd.into_raw_fd())
        };
        NativeHandle::from_ptr(HandleKind::Client, client).ok_or_else(last_os_error)
    }

    fn client_destroy(&self, client: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_client_destroy, client.as_ptr()) }
    }

    fn client_flush(&self, client: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_client_flush, client.as_ptr()) }
    }

    fn client_display(&self, client: NativeHandle) -> NativeHandle {
        let display =
            unsafe { ffi_dispatch!(wayland_server_handle(), wl_client_get_display, client.as_ptr()) };
        NativeHandle::from_raw_parts(HandleKind::Display, display as usize)
    }

    fn client_post_no_memory(&self, client: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_client_post_no_memory, client.as_ptr()) }
    }

    fn client_post_error(&self, client: NativeHandle, code: u32, message: &CStr) {
        // errors not bound to an object are posted on the wl_display of the client
        let display =
            unsafe { ffi_dispatch!(wayland_server_handle(), wl_client_get_object, client.as_ptr(), 1) };
        if display.is_null() {
            crate::log_warn!("Client {} has no wl_display to post an error on", client);
            return;
        }
        unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_resource_post_error, display, code, message.as_ptr())
        }
    }

    fn resource_create(
        &self,
        client: NativeHandle,
        interface: &'static Interface,
        version: u32,
        id: u32,
    ) -> Result<NativeHandle, NativeError> {
        let resource = unsafe {
            ffi_dispatch!(
                wayland_server_handle(),
                wl_resource_create,
                client.as_ptr(),
                c_interface(interface),
                version as c_int,
                id
            )
        };
        handle(HandleKind::Resource, resource)
    }

    fn resource_set_dispatcher(&self, resource: NativeHandle, dispatcher: Arc<dyn NativeDispatcher>) {
        let ptr = resource.as_ptr::<wl_resource>();
        let data = Box::into_raw(Box::new(dispatcher));
        unsafe {
            ffi_dispatch!(
                wayland_server_handle(),
                wl_resource_set_dispatcher,
                ptr,
                resource_dispatcher,
                rust_managed(),
                data as *mut c_void,
                Some(resource_destructor)
            )
        }
    }

    fn resource_destroy(&self, resource: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_resource_destroy, resource.as_ptr()) }
    }

    fn resource_client(&self, resource: NativeHandle) -> NativeHandle {
        let client =
            unsafe { ffi_dispatch!(wayland_server_handle(), wl_resource_get_client, resource.as_ptr()) };
        NativeHandle::from_raw_parts(HandleKind::Client, client as usize)
    }

    fn resource_id(&self, resource: NativeHandle) -> u32 {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_resource_get_id, resource.as_ptr()) }
    }

    fn resource_version(&self, resource: NativeHandle) -> u32 {
        let version =
            unsafe { ffi_dispatch!(wayland_server_handle(), wl_resource_get_version, resource.as_ptr()) };
        version as u32
    }

    fn resource_post_event(&self, resource: NativeHandle, opcode: u32, args: &[Argument<'_>]) {
        let ptr = resource.as_ptr::<wl_resource>();
        let client = unsafe { ffi_dispatch!(wayland_server_handle(), wl_resource_get_client, ptr) };
        // libwayland-server sends the id of the resource given for a new_id
        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            let arg = match *arg {
                Argument::NewId(id) => {
                    let child =
                        unsafe { ffi_dispatch!(wayland_server_handle(), wl_client_get_object, client, id) };
                    match NativeHandle::from_ptr(HandleKind::Resource, child) {
                        Some(child) => Argument::NewObject(child),
                        None => {
                            crate::log_error!("Cannot send an event creating the unknown object {}", id);
                            return;
                        }
                    }
                }
                ref arg => arg.clone(),
            };
            resolved.push(arg);
        }
        let mut list = ArgumentList::new(&resolved);
        unsafe {
            ffi_dispatch!(
                wayland_server_handle(),
                wl_resource_post_event_array,
                ptr,
                opcode,
                list.as_mut_ptr()
            )
        }
    }

    fn resource_post_error(&self, resource: NativeHandle, code: u32, message: &CStr) {
        unsafe {
            ffi_dispatch!(
                wayland_server_handle(),
                wl_resource_post_error,
                resource.as_ptr(),
                code,
                message.as_ptr()
            )
        }
    }

    fn resource_post_no_memory(&self, resource: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_resource_post_no_memory, resource.as_ptr()) }
    }

    fn add_destroy_listener(
        &self,
        object: NativeHandle,
        notify: DestroyNotify,
    ) -> Result<ListenerToken, NativeError> {
        if !matches!(
            object.kind(),
            HandleKind::Display | HandleKind::Client | HandleKind::Resource | HandleKind::EventLoop
        ) {
            return Err(NativeError::Unsupported("destroy signal of this kind of object"));
        }
        let listener = signal::rust_listener_create(destroy_notify);
        let data = Box::new(ListenerData { notify, object, live: self.listeners.clone() });
        unsafe { signal::rust_listener_set_user_data(listener, Box::into_raw(data) as *mut c_void) };
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).insert(listener as usize);
        unsafe {
            match object.kind() {
                HandleKind::Display => ffi_dispatch!(
                    wayland_server_handle(),
                    wl_display_add_destroy_listener,
                    object.as_ptr(),
                    listener
                ),
                HandleKind::Client => ffi_dispatch!(
                    wayland_server_handle(),
                    wl_client_add_destroy_listener,
                    object.as_ptr(),
                    listener
                ),
                HandleKind::Resource => ffi_dispatch!(
                    wayland_server_handle(),
                    wl_resource_add_destroy_listener,
                    object.as_ptr(),
                    listener
                ),
                _ => ffi_dispatch!(
                    wayland_server_handle(),
                    wl_event_loop_add_destroy_listener,
                    object.as_ptr(),
                    listener
                ),
            }
        }
        Ok(ListenerToken::new(object, listener as usize))
    }

    fn remove_destroy_listener(&self, token: ListenerToken) {
        let removed = self.listeners.lock().unwrap_or_else(PoisonError::into_inner).remove(&token.id());
        if !removed {
            // already fired
            return;
        }
        let listener = token.id() as *mut wl_listener;
        unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_list_remove, &mut (*listener).link);
            drop(Box::from_raw(signal::rust_listener_get_user_data(listener) as *mut ListenerData));
            signal::rust_listener_destroy(listener);
        }
    }

    fn global_create(
        &self,
        display: NativeHandle,
        interface: &'static Interface,
        version: u32,
        handler: Arc<dyn BindHandler>,
    ) -> Result<NativeHandle, NativeError> {
        let data = Box::into_raw(Box::new(GlobalData { handler, global: 0 }));
        let global = unsafe {
            ffi_dispatch!(
                wayland_server_handle(),
                wl_global_create,
                display.as_ptr(),
                c_interface(interface),
                version as c_int,
                data as *mut c_void,
                global_bind
            )
        };
        if global.is_null() {
            drop(unsafe { Box::from_raw(data) });
            return Err(NativeError::NoMemory);
        }
        // Safety: binds only happen while dispatching the display
        unsafe { (*data).global = global as usize };
        self.lock().globals.insert(global as usize, (display.addr(), data as usize));
        handle(HandleKind::Global, global)
    }

    fn global_destroy(&self, global: NativeHandle) {
        let entry = self.lock().globals.remove(&global.addr());
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_global_destroy, global.as_ptr()) };
        if let Some((_, data)) = entry {
            drop(unsafe { Box::from_raw(data as *mut GlobalData) });
        }
    }

    fn event_loop_create(&self) -> Result<NativeHandle, NativeError> {
        let event_loop = unsafe { ffi_dispatch!(wayland_server_handle(), wl_event_loop_create) };
        NativeHandle::from_ptr(HandleKind::EventLoop, event_loop).ok_or_else(last_os_error)
    }

    fn event_loop_destroy(&self, event_loop: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_event_loop_destroy, event_loop.as_ptr()) };
        free_sources(&self.sources, event_loop.addr());
    }

    fn event_loop_fd(&self, event_loop: NativeHandle) -> Result<RawFd, NativeError> {
        let fd = unsafe { ffi_dispatch!(wayland_server_handle(), wl_event_loop_get_fd, event_loop.as_ptr()) };
        if fd < 0 {
            return Err(NativeError::InvalidObject);
        }
        Ok(fd)
    }

    fn event_loop_add_fd(
        &self,
        event_loop: NativeHandle,
        fd: RawFd,
        mask: FdMask,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        self.add_source(event_loop, callback, false, |data| unsafe {
            ffi_dispatch!(
                wayland_server_handle(),
                wl_event_loop_add_fd,
                event_loop.as_ptr(),
                fd,
                mask.bits(),
                source_fd,
                data
            )
        })
    }

    fn event_loop_add_timer(
        &self,
        event_loop: NativeHandle,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        self.add_source(event_loop, callback, false, |data| unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_event_loop_add_timer, event_loop.as_ptr(), source_timer, data)
        })
    }

    fn event_loop_add_signal(
        &self,
        event_loop: NativeHandle,
        signal: i32,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        self.add_source(event_loop, callback, false, |data| unsafe {
            ffi_dispatch!(
                wayland_server_handle(),
                wl_event_loop_add_signal,
                event_loop.as_ptr(),
                signal,
                source_signal,
                data
            )
        })
    }

    fn event_loop_add_idle(
        &self,
        event_loop: NativeHandle,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        self.add_source(event_loop, callback, true, |data| unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_event_loop_add_idle, event_loop.as_ptr(), source_idle, data)
        })
    }

    fn event_source_fd_update(&self, source: NativeHandle, mask: FdMask) -> Result<(), NativeError> {
        let ret = unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_event_source_fd_update, source.as_ptr(), mask.bits())
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    fn event_source_timer_update(&self, source: NativeHandle, ms: u32) -> Result<(), NativeError> {
        let ms = c_int::try_from(ms).unwrap_or(c_int::MAX);
        let ret = unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_event_source_timer_update, source.as_ptr(), ms)
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    fn event_source_remove(&self, source: NativeHandle) {
        let entry = self.lock_sources().sources.remove(&source.addr());
        let Some((_, data)) = entry else {
            // idle sources are gone once they ran
            return;
        };
        unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_event_source_remove, source.as_ptr());
            drop(Box::from_raw(data as *mut SourceData));
        }
    }

    fn event_source_check(&self, source: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_event_source_check, source.as_ptr()) }
    }

    fn event_loop_dispatch(
        &self,
        event_loop: NativeHandle,
        timeout: Option<Duration>,
    ) -> Result<(), NativeError> {
        let timeout = match timeout {
            Some(timeout) => c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX),
            None => -1,
        };
        let ret = unsafe {
            ffi_dispatch!(wayland_server_handle(), wl_event_loop_dispatch, event_loop.as_ptr(), timeout)
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    fn event_loop_dispatch_idle(&self, event_loop: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_server_handle(), wl_event_loop_dispatch_idle, event_loop.as_ptr()) }
    }
}

/// Free the callbacks of the sources libwayland destroyed with their loop
fn free_sources(sources: &Mutex<SourceTable>, event_loop: usize) {
    let dead: Vec<usize> = {
        let mut table = sources.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<usize> =
            table.sources.iter().filter(|(_, (owner, _))| *owner == event_loop).map(|(k, _)| *k).collect();
        keys.into_iter().filter_map(|key| table.sources.remove(&key)).map(|(_, data)| data).collect()
    };
    for data in dead {
        drop(unsafe { Box::from_raw(data as *mut SourceData) });
    }
}

fn guard<F: FnOnce() -> c_int>(what: &str, f: F) -> c_int {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(ret) => ret,
        Err(payload) => {
            crate::log_error!("Native callback of {} panicked: {}", what, panic_message(&*payload));
            -1
        }
    }
}

unsafe extern "C" fn destroy_notify(listener: *mut wl_listener, _: *mut c_void) {
    // Safety: libwayland unlinked the listener before calling it, nothing else refers to it
    let data = unsafe {
        let data = Box::from_raw(signal::rust_listener_get_user_data(listener) as *mut ListenerData);
        signal::rust_listener_destroy(listener);
        data
    };
    data.live.lock().unwrap_or_else(PoisonError::into_inner).remove(&(listener as usize));
    let ListenerData { notify, object, .. } = *data;
    guard("a destroy listener", move || {
        notify(object);
        0
    });
}

unsafe extern "C" fn resource_dispatcher(
    _: *const c_void,
    resource: *mut c_void,
    opcode: u32,
    message: *const wl_message,
    args: *const wl_argument,
) -> c_int {
    let resource = resource as *mut wl_resource;
    // Safety: the user data of a resource with this dispatcher is a boxed dispatcher
    let dispatcher = unsafe {
        let data = ffi_dispatch!(wayland_server_handle(), wl_resource_get_user_data, resource);
        (*(data as *const Arc<dyn NativeDispatcher>)).clone()
    };
    let Some(args) = (unsafe { read_arguments(message, args, HandleKind::Resource) }) else {
        return -1;
    };
    let target = NativeHandle::from_raw_parts(HandleKind::Resource, resource as usize);
    guard("a resource dispatcher", || dispatcher.dispatch(target, opcode, &args))
}

unsafe extern "C" fn resource_destructor(resource: *mut wl_resource) {
    unsafe {
        let data = ffi_dispatch!(wayland_server_handle(), wl_resource_get_user_data, resource);
        drop(Box::from_raw(data as *mut Arc<dyn NativeDispatcher>));
    }
}

unsafe extern "C" fn global_bind(client: *mut wl_client, data: *mut c_void, version: u32, id: u32) {
    // Safety: the data of a global lives until the global is destroyed
    let (handler, global) = unsafe {
        let data = &*(data as *const GlobalData);
        (data.handler.clone(), data.global)
    };
    let global = NativeHandle::from_raw_parts(HandleKind::Global, global);
    let client = NativeHandle::from_raw_parts(HandleKind::Client, client as usize);
    guard("a global bind", || {
        handler.bind(global, client, version, id);
        0
    });
}

unsafe fn source_callback(data: *mut c_void) -> SourceCallback {
    // Safety: the data of a source lives until the source is removed
    unsafe { (*(data as *const SourceData)).callback.clone() }
}

unsafe extern "C" fn source_fd(fd: c_int, mask: u32, data: *mut c_void) -> c_int {
    let callback = unsafe { source_callback(data) };
    guard("an fd source", || callback(SourceEvent::Fd { fd, mask: FdMask::from_bits(mask) }))
}

unsafe extern "C" fn source_timer(data: *mut c_void) -> c_int {
    let callback = unsafe { source_callback(data) };
    guard("a timer source", || callback(SourceEvent::Timer))
}

unsafe extern "C" fn source_signal(signal: c_int, data: *mut c_void) -> c_int {
    let callback = unsafe { source_callback(data) };
    guard("a signal source", || callback(SourceEvent::Signal(signal)))
}

unsafe extern "C" fn source_idle(data: *mut c_void) {
    // libwayland frees an idle source after running it
    let data = unsafe { Box::from_raw(data as *mut SourceData) };
    if let Some(table) = &data.table {
        table.lock().unwrap_or_else(PoisonError::into_inner).sources.remove(&data.source);
    }
    let callback = data.callback.clone();
    drop(data);
    guard("an idle source", || callback(SourceEvent::Idle));
}
