//! Core interfaces of the protocol
//!
//! `wl_display`, `wl_registry` and `wl_callback` are frozen in the protocol and can never change.
//! They are the only interfaces the native libraries handle on their own: the bridge needs their
//! metadata to set up client connections and to decode protocol errors.

use crate::protocol::{AllowNull, ArgumentType, Interface, MessageDesc, ANONYMOUS_INTERFACE};

/// Opcode of `wl_display.sync`
pub const WL_DISPLAY_SYNC: u32 = 0;
/// Opcode of `wl_display.get_registry`
pub const WL_DISPLAY_GET_REGISTRY: u32 = 1;
/// Opcode of the `wl_display.error` event
pub const WL_DISPLAY_ERROR: u32 = 0;
/// Opcode of the `wl_display.delete_id` event
pub const WL_DISPLAY_DELETE_ID: u32 = 1;
/// Opcode of `wl_registry.bind`
pub const WL_REGISTRY_BIND: u32 = 0;
/// Opcode of the `wl_registry.global` event
pub const WL_REGISTRY_GLOBAL: u32 = 0;
/// Opcode of the `wl_registry.global_remove` event
pub const WL_REGISTRY_GLOBAL_REMOVE: u32 = 1;
/// Opcode of the `wl_callback.done` event
pub const WL_CALLBACK_DONE: u32 = 0;

/// Interface `wl_display`
pub static WL_DISPLAY_INTERFACE: Interface = Interface {
    name: "wl_display",
    version: 1,
    requests: &[
        MessageDesc {
            name: "sync",
            since: 1,
            is_destructor: false,
            signature: &[ArgumentType::NewId],
            child_interface: Some(&WL_CALLBACK_INTERFACE),
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "get_registry",
            since: 1,
            is_destructor: false,
            signature: &[ArgumentType::NewId],
            child_interface: Some(&WL_REGISTRY_INTERFACE),
            arg_interfaces: &[],
        },
    ],
    events: &[
        MessageDesc {
            name: "error",
            since: 1,
            is_destructor: false,
            signature: &[
                ArgumentType::Object(AllowNull::No),
                ArgumentType::Uint,
                ArgumentType::Str(AllowNull::No),
            ],
            child_interface: None,
            arg_interfaces: &[&ANONYMOUS_INTERFACE],
        },
        MessageDesc {
            name: "delete_id",
            since: 1,
            is_destructor: false,
            signature: &[ArgumentType::Uint],
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
};

/// Interface `wl_registry`
pub static WL_REGISTRY_INTERFACE: Interface = Interface {
    name: "wl_registry",
    version: 1,
    requests: &[MessageDesc {
        name: "bind",
        since: 1,
        is_destructor: false,
        signature: &[
            ArgumentType::Uint,
            ArgumentType::Str(AllowNull::No),
            ArgumentType::Uint,
            ArgumentType::NewId,
        ],
        child_interface: None,
        arg_interfaces: &[],
    }],
    events: &[
        MessageDesc {
            name: "global",
            since: 1,
            is_destructor: false,
            signature: &[ArgumentType::Uint, ArgumentType::Str(AllowNull::No), ArgumentType::Uint],
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "global_remove",
            since: 1,
            is_destructor: false,
            signature: &[ArgumentType::Uint],
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
};

/// Interface `wl_callback`
pub static WL_CALLBACK_INTERFACE: Interface = Interface {
    name: "wl_callback",
    version: 1,
    requests: &[],
    events: &[MessageDesc {
        name: "done",
        since: 1,
        is_destructor: true,
        signature: &[ArgumentType::Uint],
        child_interface: None,
        arg_interfaces: &[],
    }],
};
