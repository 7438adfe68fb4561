//! [`ClientLibrary`] over `libwayland-client`

use std::{
    collections::{HashMap, HashSet},
    ffi::{CStr, CString},
    fmt,
    os::{
        raw::{c_int, c_void},
        unix::io::{IntoRawFd, OwnedFd, RawFd},
    },
    panic::{catch_unwind, AssertUnwindSafe},
    ptr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use wayland_sys::{
    client::*,
    common::{wl_argument, wl_interface, wl_message},
    ffi_dispatch,
};

use crate::{
    dispatch::panic_message,
    native::{ClientLibrary, NativeDispatcher},
    protocol::{Argument, Interface, ProtocolError},
    types::{HandleKind, NativeError, NativeHandle},
};

use super::{c_interface, read_arguments, rust_managed, ArgumentList};

#[cfg(feature = "log")]
extern "C" {
    fn wl_log_trampoline_to_rust_client(fmt: *const std::os::raw::c_char, list: *const c_void);
}

/// What the library knows of a proxy it did not create for a connection
struct ProxyEntry {
    connection: usize,
    /// Boxed `ProxyListener`, once a dispatcher is installed
    listener: Option<usize>,
}

#[derive(Default)]
struct ProxyTable {
    connections: HashSet<usize>,
    proxies: HashMap<usize, ProxyEntry>,
}

impl ProxyTable {
    fn connection_of(&self, proxy: usize) -> usize {
        // the wl_display proxy is the connection itself
        self.proxies.get(&proxy).map_or(proxy, |entry| entry.connection)
    }
}

struct ProxyListener {
    dispatcher: Arc<dyn NativeDispatcher>,
    table: Arc<Mutex<ProxyTable>>,
}

/// The client side of the system `libwayland`
pub struct SystemClient {
    table: Arc<Mutex<ProxyTable>>,
}

fn lock(table: &Mutex<ProxyTable>) -> MutexGuard<'_, ProxyTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Release a proxy and the listener installed on it
///
/// # Safety
///
/// The proxy must be alive and unknown to the table.
unsafe fn destroy_proxy(proxy: usize, entry: ProxyEntry) {
    unsafe {
        ffi_dispatch!(wayland_client_handle(), wl_proxy_destroy, proxy as *mut wl_proxy);
        if let Some(listener) = entry.listener {
            drop(Box::from_raw(listener as *mut ProxyListener));
        }
    }
}

impl SystemClient {
    /// Load `libwayland-client`
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
                wayland_client_handle(),
                wl_log_set_handler_client,
                wl_log_trampoline_to_rust_client
            )
        };
        Ok(Self { table: Arc::new(Mutex::new(ProxyTable::default())) })
    }

    fn connected(&self, display: *mut wl_display) -> Result<NativeHandle, NativeError> {
        let connection = NativeHandle::from_ptr(HandleKind::Connection, display)
            .ok_or_else(|| NativeError::Io(std::io::Error::last_os_error()))?;
        lock(&self.table).connections.insert(connection.addr());
        Ok(connection)
    }

    /// Translate a failure of libwayland-client, which sets `errno`
    fn error(&self, connection: NativeHandle) -> NativeError {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(rustix::io::Errno::PROTO.raw_os_error()) {
            if let Some(err) = self.display_protocol_error(connection) {
                return NativeError::Protocol(err);
            }
        }
        NativeError::Io(err)
    }
}

impl fmt::Debug for SystemClient {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = lock(&self.table);
        f.debug_struct("SystemClient")
            .field("connections", &table.connections.len())
            .field("proxies", &table.proxies.len())
            .finish()
    }
}

impl ClientLibrary for SystemClient {
    fn display_connect(&self, name: Option<&str>) -> Result<NativeHandle, NativeError> {
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(|_| NativeError::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;
        let display = unsafe {
            ffi_dispatch!(
                wayland_client_handle(),
                wl_display_connect,
                name.as_ref().map_or(ptr::null(), |name| name.as_ptr())
            )
        };
        self.connected(display)
    }

    fn display_connect_to_fd(&self, fd: OwnedFd) -> Result<NativeHandle, NativeError> {
        let display =
            unsafe { ffi_dispatch!(wayland_client_handle(), wl_display_connect_to_fd, fd.into_raw_fd()) };
        self.connected(display)
    }

    fn display_disconnect(&self, connection: NativeHandle) {
        let proxies: Vec<(usize, ProxyEntry)> = {
            let mut table = lock(&self.table);
            if !table.connections.remove(&connection.addr()) {
                return;
            }
            let owned: Vec<usize> = table
                .proxies
                .iter()
                .filter(|(_, entry)| entry.connection == connection.addr())
                .map(|(proxy, _)| *proxy)
                .collect();
            owned.into_iter().filter_map(|proxy| table.proxies.remove_entry(&proxy)).collect()
        };
        // libwayland-client leaves the proxies to the caller
        for (proxy, entry) in proxies {
            unsafe { destroy_proxy(proxy, entry) };
        }
        unsafe { ffi_dispatch!(wayland_client_handle(), wl_display_disconnect, connection.as_ptr()) }
    }

    fn display_dispatch(&self, connection: NativeHandle) -> Result<usize, NativeError> {
        let ret = unsafe { ffi_dispatch!(wayland_client_handle(), wl_display_dispatch, connection.as_ptr()) };
        if ret < 0 {
            return Err(self.error(connection));
        }
        Ok(ret as usize)
    }

    fn display_dispatch_pending(&self, connection: NativeHandle) -> Result<usize, NativeError> {
        let ret = unsafe {
            ffi_dispatch!(wayland_client_handle(), wl_display_dispatch_pending, connection.as_ptr())
        };
        if ret < 0 {
            return Err(self.error(connection));
        }
        Ok(ret as usize)
    }

    fn display_flush(&self, connection: NativeHandle) -> Result<(), NativeError> {
        let ret = unsafe { ffi_dispatch!(wayland_client_handle(), wl_display_flush, connection.as_ptr()) };
        if ret < 0 {
            return Err(self.error(connection));
        }
        Ok(())
    }

    fn display_roundtrip(&self, connection: NativeHandle) -> Result<usize, NativeError> {
        let ret = unsafe { ffi_dispatch!(wayland_client_handle(), wl_display_roundtrip, connection.as_ptr()) };
        if ret < 0 {
            return Err(self.error(connection));
        }
        Ok(ret as usize)
    }

    fn display_protocol_error(&self, connection: NativeHandle) -> Option<ProtocolError> {
        let display = connection.as_ptr::<wl_display>();
        let errno = unsafe { ffi_dispatch!(wayland_client_handle(), wl_display_get_error, display) };
        if errno != rustix::io::Errno::PROTO.raw_os_error() {
            return None;
        }
        let mut interface: *const wl_interface = ptr::null();
        let mut object_id = 0;
        let code = unsafe {
            ffi_dispatch!(
                wayland_client_handle(),
                wl_display_get_protocol_error,
                display,
                &mut interface,
                &mut object_id
            )
        };
        let object_interface = if interface.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr((*interface).name) }.to_string_lossy().into_owned()
        };
        // libwayland-client does not keep the message
        Some(ProtocolError { code, object_id, object_interface, message: String::new() })
    }

    fn display_get_fd(&self, connection: NativeHandle) -> Result<RawFd, NativeError> {
        Ok(unsafe { ffi_dispatch!(wayland_client_handle(), wl_display_get_fd, connection.as_ptr()) })
    }

    fn display_create_queue(&self, connection: NativeHandle) -> Result<NativeHandle, NativeError> {
        let queue =
            unsafe { ffi_dispatch!(wayland_client_handle(), wl_display_create_queue, connection.as_ptr()) };
        NativeHandle::from_ptr(HandleKind::EventQueue, queue).ok_or(NativeError::NoMemory)
    }

    fn display_dispatch_queue(
        &self,
        connection: NativeHandle,
        queue: NativeHandle,
    ) -> Result<usize, NativeError> {
        let ret = unsafe {
            ffi_dispatch!(
                wayland_client_handle(),
                wl_display_dispatch_queue,
                connection.as_ptr(),
                queue.as_ptr::<wl_event_queue>()
            )
        };
        if ret < 0 {
            return Err(self.error(connection));
        }
        Ok(ret as usize)
    }

    fn display_dispatch_queue_pending(
        &self,
        connection: NativeHandle,
        queue: NativeHandle,
    ) -> Result<usize, NativeError> {
        let ret = unsafe {
            ffi_dispatch!(
                wayland_client_handle(),
                wl_display_dispatch_queue_pending,
                connection.as_ptr(),
                queue.as_ptr::<wl_event_queue>()
            )
        };
        if ret < 0 {
            return Err(self.error(connection));
        }
        Ok(ret as usize)
    }

    fn event_queue_destroy(&self, queue: NativeHandle) {
        unsafe { ffi_dispatch!(wayland_client_handle(), wl_event_queue_destroy, queue.as_ptr()) }
    }

    fn proxy_marshal(
        &self,
        proxy: NativeHandle,
        opcode: u32,
        args: &[Argument<'_>],
        child: Option<(&'static Interface, u32)>,
    ) -> Result<Option<NativeHandle>, NativeError> {
        let ptr = proxy.as_ptr::<wl_proxy>();
        let mut list = ArgumentList::new(args);
        let Some((interface, version)) = child else {
            unsafe {
                ffi_dispatch!(wayland_client_handle(), wl_proxy_marshal_array, ptr, opcode, list.as_mut_ptr())
            };
            return Ok(None);
        };
        let created = unsafe {
            ffi_dispatch!(
                wayland_client_handle(),
                wl_proxy_marshal_array_constructor_versioned,
                ptr,
                opcode,
                list.as_mut_ptr(),
                c_interface(interface),
                version
            )
        };
        let created = NativeHandle::from_ptr(HandleKind::Proxy, created).ok_or(NativeError::NoMemory)?;
        let mut table = lock(&self.table);
        let connection = table.connection_of(proxy.addr());
        table.proxies.insert(created.addr(), ProxyEntry { connection, listener: None });
        Ok(Some(created))
    }

    fn proxy_set_dispatcher(&self, proxy: NativeHandle, dispatcher: Arc<dyn NativeDispatcher>) {
        let ptr = proxy.as_ptr::<wl_proxy>();
        let mut table = lock(&self.table);
        if table.connections.contains(&proxy.addr()) {
            crate::log_warn!("The events of wl_display are handled by libwayland-client");
            return;
        }
        let listener = Box::into_raw(Box::new(ProxyListener { dispatcher, table: self.table.clone() }));
        let entry = table.proxies.entry(proxy.addr()).or_insert(ProxyEntry { connection: 0, listener: None });
        match entry.listener.replace(listener as usize) {
            Some(previous) => unsafe {
                ffi_dispatch!(wayland_client_handle(), wl_proxy_set_user_data, ptr, listener as *mut c_void);
                drop(Box::from_raw(previous as *mut ProxyListener));
            },
            None => unsafe {
                ffi_dispatch!(
                    wayland_client_handle(),
                    wl_proxy_add_dispatcher,
                    ptr,
                    proxy_dispatcher,
                    rust_managed(),
                    listener as *mut c_void
                );
            },
        }
    }

    fn proxy_set_queue(&self, proxy: NativeHandle, queue: Option<NativeHandle>) {
        let queue = queue.map_or(ptr::null_mut(), |queue| queue.as_ptr::<wl_event_queue>());
        unsafe { ffi_dispatch!(wayland_client_handle(), wl_proxy_set_queue, proxy.as_ptr(), queue) }
    }

    fn proxy_destroy(&self, proxy: NativeHandle) {
        let entry = {
            let mut table = lock(&self.table);
            if table.connections.contains(&proxy.addr()) {
                // the wl_display proxy goes away with the connection
                return;
            }
            table.proxies.remove(&proxy.addr())
        };
        match entry {
            Some(entry) => unsafe { destroy_proxy(proxy.addr(), entry) },
            None => unsafe { ffi_dispatch!(wayland_client_handle(), wl_proxy_destroy, proxy.as_ptr()) },
        }
    }

    fn proxy_id(&self, proxy: NativeHandle) -> u32 {
        unsafe { ffi_dispatch!(wayland_client_handle(), wl_proxy_get_id, proxy.as_ptr()) }
    }

    fn proxy_version(&self, proxy: NativeHandle) -> u32 {
        unsafe { ffi_dispatch!(wayland_client_handle(), wl_proxy_get_version, proxy.as_ptr()) }
    }
}

unsafe extern "C" fn proxy_dispatcher(
    _: *const c_void,
    proxy: *mut c_void,
    opcode: u32,
    message: *const wl_message,
    args: *const wl_argument,
) -> c_int {
    let proxy = proxy as *mut wl_proxy;
    // Safety: the user data of a proxy with this dispatcher is a boxed listener
    let (dispatcher, table) = unsafe {
        let data = ffi_dispatch!(wayland_client_handle(), wl_proxy_get_user_data, proxy);
        let listener = &*(data as *const ProxyListener);
        (listener.dispatcher.clone(), listener.table.clone())
    };
    let Some(args) = (unsafe { read_arguments(message, args, HandleKind::Proxy) }) else {
        return -1;
    };
    // proxies created by libwayland-client for new_id arguments belong to the same connection
    {
        let mut table = lock(&table);
        let connection = table.connection_of(proxy as usize);
        for arg in &args {
            if let Argument::NewObject(child) = arg {
                table.proxies.insert(child.addr(), ProxyEntry { connection, listener: None });
            }
        }
    }
    let target = NativeHandle::from_raw_parts(HandleKind::Proxy, proxy as usize);
    match catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(target, opcode, &args))) {
        Ok(ret) => ret,
        Err(payload) => {
            crate::log_error!("Native dispatcher of {} panicked: {}", target, panic_message(&*payload));
            -1
        }
    }
}
