//! The native library backed by the system `libwayland`
//!
//! Every callback handed to the library (dispatchers, bind handlers, destroy listeners, event
//! source callbacks) is boxed and passed as the user data of a C trampoline. The boxes are freed
//! when the library forgets the object they belong to.

use std::{
    borrow::Cow,
    collections::HashMap,
    ffi::{CStr, CString},
    os::raw::{c_char, c_void},
    ptr,
    sync::{Mutex, PoisonError},
};

use smallvec::SmallVec;
use wayland_sys::common::{wl_argument, wl_array, wl_interface, wl_message};

use crate::{
    protocol::{parse_signature, signature_string, Argument, ArgumentType, Interface, MessageDesc, INLINE_ARGS},
    types::{HandleKind, NativeHandle},
};

#[cfg(feature = "client_system")]
pub mod client;
#[cfg(feature = "server_system")]
pub mod server;

/// Marks the objects whose dispatcher is installed by this crate
///
/// Only its address matters, it is passed as the implementation of the dispatchers.
static RUST_MANAGED: u8 = 42;

fn rust_managed() -> *const c_void {
    &RUST_MANAGED as *const u8 as *const c_void
}

/// `wl_interface` descriptions, built once per [`Interface`] and never freed
static C_INTERFACES: Mutex<Option<HashMap<usize, usize>>> = Mutex::new(None);

/// The `wl_interface` libwayland expects for `interface`
pub(crate) fn c_interface(interface: &'static Interface) -> *const wl_interface {
    let mut cache = C_INTERFACES.lock().unwrap_or_else(PoisonError::into_inner);
    build_interface(cache.get_or_insert_with(HashMap::new), interface)
}

fn leak_cstr(s: &str) -> *const c_char {
    // names and signatures never contain a nul byte
    let cstr = CString::new(s).unwrap_or_default();
    Box::leak(cstr.into_boxed_c_str()).as_ptr()
}

fn build_interface(cache: &mut HashMap<usize, usize>, interface: &'static Interface) -> *const wl_interface {
    let key = interface as *const Interface as usize;
    if let Some(&addr) = cache.get(&key) {
        return addr as *const wl_interface;
    }
    let c_iface = Box::leak(Box::new(wl_interface {
        name: leak_cstr(interface.name),
        version: interface.version as i32,
        request_count: 0,
        requests: ptr::null(),
        event_count: 0,
        events: ptr::null(),
    }));
    // registered before the messages so that self references resolve
    cache.insert(key, c_iface as *mut wl_interface as usize);
    let requests = build_messages(cache, interface.requests);
    let events = build_messages(cache, interface.events);
    c_iface.request_count = interface.requests.len() as i32;
    c_iface.requests = requests;
    c_iface.event_count = interface.events.len() as i32;
    c_iface.events = events;
    c_iface
}

fn build_messages(cache: &mut HashMap<usize, usize>, messages: &'static [MessageDesc]) -> *const wl_message {
    if messages.is_empty() {
        return ptr::null();
    }
    let messages: Vec<wl_message> = messages
        .iter()
        .map(|desc| {
            let mut objects = desc.arg_interfaces.iter();
            let types: Vec<*const wl_interface> = desc
                .signature
                .iter()
                .map(|typ| match typ {
                    ArgumentType::Object(_) => match objects.next() {
                        Some(iface) => build_interface(cache, iface),
                        None => ptr::null(),
                    },
                    ArgumentType::NewId => match desc.child_interface {
                        Some(iface) => build_interface(cache, iface),
                        None => ptr::null(),
                    },
                    _ => ptr::null(),
                })
                .collect();
            wl_message {
                name: leak_cstr(desc.name),
                signature: leak_cstr(&signature_string(desc.since, desc.signature)),
                types: Box::leak(types.into_boxed_slice()).as_ptr(),
            }
        })
        .collect();
    Box::leak(messages.into_boxed_slice()).as_ptr()
}

/// Arguments laid out as a `wl_argument` array
///
/// The arrays and strings are borrowed from the source arguments, which must outlive the list.
pub(crate) struct ArgumentList {
    args: SmallVec<[wl_argument; INLINE_ARGS]>,
    _arrays: SmallVec<[Box<wl_array>; 1]>,
}

impl ArgumentList {
    pub(crate) fn new(args: &[Argument<'_>]) -> Self {
        let mut list = SmallVec::with_capacity(args.len());
        let mut arrays = SmallVec::new();
        for arg in args {
            let arg = match arg {
                Argument::Int(i) => wl_argument { i: *i },
                Argument::Uint(u) => wl_argument { u: *u },
                Argument::Fixed(f) => wl_argument { f: *f },
                Argument::Fd(h) => wl_argument { h: *h },
                Argument::Str(s) => {
                    wl_argument { s: s.as_ref().map_or(ptr::null(), |s| s.as_ptr()) }
                }
                Argument::Object(o) => {
                    wl_argument { o: o.map_or(ptr::null(), |o| o.as_ptr::<c_void>() as *const c_void) }
                }
                Argument::NewId(n) => wl_argument { n: *n },
                Argument::NewObject(o) => wl_argument { o: o.as_ptr::<c_void>() as *const c_void },
                Argument::Array(data) => {
                    let array = Box::new(wl_array {
                        size: data.len(),
                        alloc: data.len(),
                        data: data.as_ptr() as *mut c_void,
                    });
                    let a: *const wl_array = &*array;
                    arrays.push(array);
                    wl_argument { a }
                }
            };
            list.push(arg);
        }
        Self { args: list, _arrays: arrays }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut wl_argument {
        self.args.as_mut_ptr()
    }
}

/// Read the arguments of an inbound message
///
/// Objects are designated as `kind` handles. libwayland-client hands the proxy it created for a
/// `new_id` argument, libwayland-server only its id.
///
/// # Safety
///
/// `message` and `args` must be the ones libwayland passed to a dispatcher.
pub(crate) unsafe fn read_arguments<'a>(
    message: *const wl_message,
    args: *const wl_argument,
    kind: HandleKind,
) -> Option<SmallVec<[Argument<'a>; INLINE_ARGS]>> {
    // Safety: libwayland passes the description of the message it dispatches
    let signature = unsafe { CStr::from_ptr((*message).signature) };
    let signature = match parse_signature(&signature.to_string_lossy()) {
        Ok(signature) => signature,
        Err(err) => {
            crate::log_error!("Cannot read the arguments of a native message: {}", err);
            return None;
        }
    };
    let mut parsed = SmallVec::with_capacity(signature.len());
    for (i, typ) in signature.iter().enumerate() {
        // Safety: the argument array matches the signature
        let arg = unsafe { &*args.add(i) };
        let value = unsafe {
            match typ {
                ArgumentType::Int => Argument::Int(arg.i),
                ArgumentType::Uint => Argument::Uint(arg.u),
                ArgumentType::Fixed => Argument::Fixed(arg.f),
                ArgumentType::Fd => Argument::Fd(arg.h),
                ArgumentType::Str(_) if arg.s.is_null() => Argument::Str(None),
                ArgumentType::Str(_) => Argument::Str(Some(Cow::Borrowed(CStr::from_ptr(arg.s)))),
                ArgumentType::Object(_) => {
                    Argument::Object(NativeHandle::from_ptr(kind, arg.o as *mut c_void))
                }
                ArgumentType::NewId if kind == HandleKind::Proxy => {
                    match NativeHandle::from_ptr(kind, arg.o as *mut c_void) {
                        Some(proxy) => Argument::NewObject(proxy),
                        None => Argument::NewId(0),
                    }
                }
                ArgumentType::NewId => Argument::NewId(arg.n),
                ArgumentType::Array if arg.a.is_null() => Argument::Array(Cow::Borrowed(&[])),
                ArgumentType::Array => {
                    let array = &*arg.a;
                    if array.size == 0 {
                        Argument::Array(Cow::Borrowed(&[]))
                    } else {
                        Argument::Array(Cow::Borrowed(std::slice::from_raw_parts(
                            array.data as *const u8,
                            array.size,
                        )))
                    }
                }
            }
        };
        parsed.push(value);
    }
    Some(parsed)
}
