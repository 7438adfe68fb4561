//! Object identity and lifetime bridge for Wayland native objects
//!
//! This crate keeps native Wayland objects (displays, clients, resources, globals, proxies, event
//! loops and their sources) and their Rust peers consistent with each other. The native library owns
//! the objects and decides when they die, while Rust code owns its peers through [`Arc`]s; the bridge
//! reconciles both sides:
//!
//! - The [`registry::ObjectRegistry`] maps every live native handle to exactly one peer, held either
//!   strongly (the native side owns the object) or weakly (the object is free-standing and dies with
//!   its last [`Arc`]).
//! - The [`wrapper::NativeObjectWrapper`] embedded in every peer tracks the attach/detach transitions
//!   and guarantees that finalization runs exactly once, whichever of the explicit `destroy()` call,
//!   the native destroy signal or the drop of the last reference comes first.
//! - The [`dispatch`] module translates native calls into handler invocations through per-interface
//!   vtables, and marshals outgoing calls into wire arguments.
//!
//! The native library itself is abstracted by the traits of the [`native`] module. Two
//! implementations are provided: [`native::local::LocalLibrary`], an in-process implementation of
//! the library semantics that is always available, and the libwayland backend in `native::sys`,
//! enabled by the `server_system` and `client_system` cargo features. The `dlopen` cargo feature
//! makes the system libraries be loaded at runtime.
//!
//! ## Logging
//!
//! This crate can generate some runtime error messages (notably when a handler fails). By default
//! the `log` cargo feature is enabled and those messages are piped through the `log` crate. Without
//! it, they are printed to stderr.
//!
//! Setting the `WAYLAND_DEBUG` environment variable to `1`, `server` or `client` prints every
//! message going through the bridge, in the same format as libwayland.
//!
//! [`Arc`]: std::sync::Arc

#![forbid(improper_ctypes)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(unstable_coverage, feature(coverage_attribute))]
// Doc feature labels can be tested locally by running RUSTDOCFLAGS="--cfg=docsrs" cargo +nightly doc -p <crate>
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

/// Reexport of the `smallvec` crate, which is part of `wayland-bridge`'s public API.
pub extern crate smallvec;

// internal imports for dispatching logging depending on the `log` feature
#[cfg(feature = "log")]
#[allow(unused_imports)]
use log::{debug as log_debug, error as log_error, info as log_info, warn as log_warn};
#[cfg(not(feature = "log"))]
#[allow(unused_imports)]
use std::{
    eprintln as log_error, eprintln as log_warn, eprintln as log_info, eprintln as log_debug,
};

pub mod client;
pub mod codec;
pub mod core_interfaces;
mod debug;
pub mod dispatch;
pub mod native;
pub mod protocol;
pub mod registry;
pub mod server;
mod types;
pub mod wrapper;

pub use types::{BridgeError, HandleKind, InvalidId, ListenerToken, NativeError, NativeHandle};

#[cfg(test)]
mod test;

/*
 * These trampoline functions need to always be here because the build script cannot
 * conditionally build their C counterparts on the enabled features...
 * They'll be optimized out when unused.
 */

#[cfg(feature = "log")]
#[no_mangle]
extern "C" fn wl_log_rust_logger_client(msg: *const std::os::raw::c_char) {
    let cstr = unsafe { std::ffi::CStr::from_ptr(msg) };
    let text = cstr.to_string_lossy();
    log::error!("{}", text.trim_end());
}

#[cfg(feature = "log")]
#[no_mangle]
extern "C" fn wl_log_rust_logger_server(msg: *const std::os::raw::c_char) {
    let cstr = unsafe { std::ffi::CStr::from_ptr(msg) };
    let text = cstr.to_string_lossy();
    log::error!("{}", text.trim_end());
}
