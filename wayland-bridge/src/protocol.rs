//! Protocol metadata: interfaces, message signatures and wire-level argument values
//!
//! Interfaces are described by static tables the bridge checks every inbound and outbound message
//! against. The same tables are turned into native `wl_interface`s by the libwayland backend.

use std::{
    borrow::Cow,
    ffi::CStr,
    os::unix::io::RawFd,
};

use smallvec::SmallVec;

use crate::types::NativeHandle;

/// Nullability of a string or object argument (`?` in signatures)
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllowNull {
    /// `?s` or `?o`
    Yes,
    /// `s` or `o`
    No,
}

/// Type of one argument of a message signature
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ArgumentType {
    /// `i`, 32-bit signed integer
    Int,
    /// `u`, 32-bit unsigned integer
    Uint,
    /// `f`, 24.8 signed fixed point
    Fixed,
    /// `s`, UTF-8 text without interior nul
    Str(AllowNull),
    /// `o`, reference to an existing object
    Object(AllowNull),
    /// `n`, object created by the message
    NewId,
    /// `a`, opaque byte buffer
    Array,
    /// `h`, file descriptor passed along the message
    Fd,
}

impl ArgumentType {
    /// Whether a null value is accepted at this position
    pub fn allows_null(self) -> bool {
        matches!(self, Self::Str(AllowNull::Yes) | Self::Object(AllowNull::Yes))
    }

    /// The character encoding this type in a libwayland signature string
    pub fn signature_char(self) -> char {
        match self {
            Self::Int => 'i',
            Self::Uint => 'u',
            Self::Fixed => 'f',
            Self::Str(_) => 's',
            Self::Object(_) => 'o',
            Self::NewId => 'n',
            Self::Array => 'a',
            Self::Fd => 'h',
        }
    }
}

/// Error returned when parsing an invalid signature string
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureError {
    /// The offending character
    pub found: char,
    /// Its byte position in the signature
    pub position: usize,
}

impl std::error::Error for SignatureError {}

impl std::fmt::Display for SignatureError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid character {:?} at position {} of signature", self.found, self.position)
    }
}

/// Parse a libwayland signature string
///
/// Each argument is encoded by one of `i`, `u`, `f`, `s`, `o`, `n`, `a`, `h`; a `?` prefix marks a
/// nullable string or object. Leading digits (the "since" version libwayland stores in the same
/// string) are skipped.
pub fn parse_signature(signature: &str) -> Result<SmallVec<[ArgumentType; INLINE_ARGS]>, SignatureError> {
    let mut types = SmallVec::new();
    let mut nullable = false;
    let body_start = signature.find(|c: char| !c.is_ascii_digit()).unwrap_or(signature.len());
    for (position, c) in signature.char_indices().skip(body_start) {
        let allow_null = if nullable { AllowNull::Yes } else { AllowNull::No };
        let typ = match c {
            '?' if !nullable => {
                nullable = true;
                continue;
            }
            'i' => ArgumentType::Int,
            'u' => ArgumentType::Uint,
            'f' => ArgumentType::Fixed,
            's' => ArgumentType::Str(allow_null),
            'o' => ArgumentType::Object(allow_null),
            'n' => ArgumentType::NewId,
            'a' => ArgumentType::Array,
            'h' => ArgumentType::Fd,
            found => return Err(SignatureError { found, position }),
        };
        if nullable && !typ.allows_null() {
            return Err(SignatureError { found: c, position });
        }
        nullable = false;
        types.push(typ);
    }
    if nullable {
        return Err(SignatureError { found: '?', position: signature.len() - 1 });
    }
    Ok(types)
}

/// Build the libwayland signature string of a message
///
/// `since` is prepended when greater than 1, as libwayland expects it.
pub fn signature_string(since: u32, signature: &[ArgumentType]) -> String {
    let mut out = String::with_capacity(signature.len() + 4);
    if since > 1 {
        out.push_str(&since.to_string());
    }
    for typ in signature {
        if typ.allows_null() {
            out.push('?');
        }
        out.push(typ.signature_char());
    }
    out
}

/// A signed 24.8 fixed point number, as transported by the `f` wire type
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(i32);

impl Fixed {
    /// Wrap the raw wire representation
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw wire representation
    pub const fn into_raw(self) -> i32 {
        self.0
    }

    /// Convert from a floating point value, truncating the extra precision
    pub fn from_f64(value: f64) -> Self {
        Self((value * 256.) as i32)
    }

    /// Convert to a floating point value
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.
    }

    /// Convert from an integer
    pub const fn from_int(value: i32) -> Self {
        Self(value * 256)
    }

    /// Integer part of the value, rounded toward zero
    pub const fn to_int(self) -> i32 {
        self.0 / 256
    }
}

impl std::fmt::Display for Fixed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.to_f64())
    }
}

/// An argument as laid out on the native side of the bridge
///
/// Strings and arrays are borrowed from the native buffers when possible: inbound arguments point
/// into the memory of the native message for the duration of the dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument<'a> {
    /// `i`
    Int(i32),
    /// `u`
    Uint(u32),
    /// `f`, in its raw 24.8 representation
    Fixed(i32),
    /// A nul-terminated string, `None` for a null string
    Str(Option<Cow<'a, CStr>>),
    /// A native object, `None` for a null object
    Object(Option<NativeHandle>),
    /// Protocol id of a newly created object
    ///
    /// This is what servers receive in requests and send in events; clients send a placeholder
    /// that the native library replaces with the id it allocates.
    NewId(u32),
    /// A new object already created by the native library on reception
    ///
    /// libwayland-client creates the proxy of objects introduced by events before dispatching them.
    NewObject(NativeHandle),
    /// `a`, borrowed from the native message when inbound
    Array(Cow<'a, [u8]>),
    /// `h`, owned by the native library, dup it to keep it
    Fd(RawFd),
}

impl Argument<'_> {
    /// Detach the argument from the buffers it borrows
    pub fn into_owned(self) -> Argument<'static> {
        match self {
            Self::Str(text) => Argument::Str(text.map(|text| Cow::Owned(text.into_owned()))),
            Self::Array(bytes) => Argument::Array(Cow::Owned(bytes.into_owned())),
            Self::Int(i) => Argument::Int(i),
            Self::Uint(u) => Argument::Uint(u),
            Self::Fixed(raw) => Argument::Fixed(raw),
            Self::Object(handle) => Argument::Object(handle),
            Self::NewId(id) => Argument::NewId(id),
            Self::NewObject(handle) => Argument::NewObject(handle),
            Self::Fd(fd) => Argument::Fd(fd),
        }
    }
}

impl std::fmt::Display for Argument<'_> {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Uint(u) => write!(f, "{u}"),
            Self::Fixed(value) => write!(f, "{}", Fixed::from_raw(*value)),
            Self::Str(Some(value)) => write!(f, "{value:?}"),
            Self::Str(None) => f.write_str("nil"),
            Self::Object(Some(value)) => write!(f, "{value}"),
            Self::Object(None) => f.write_str("nil"),
            Self::NewId(value) => write!(f, "new id {value}"),
            Self::NewObject(value) => write!(f, "new id {value}"),
            Self::Array(value) => write!(f, "array[{}]", value.len()),
            Self::Fd(value) => write!(f, "fd {value}"),
        }
    }
}

/// Static description of a protocol interface
///
/// Messages are indexed by opcode: the opcode of a request is its position in `requests`, the one
/// of an event its position in `events`.
#[derive(Debug)]
pub struct Interface {
    /// Protocol name, such as `wl_surface`
    pub name: &'static str,
    /// Highest version described by the tables
    pub version: u32,
    /// Client to server messages
    pub requests: &'static [MessageDesc],
    /// Server to client messages
    pub events: &'static [MessageDesc],
}

impl Interface {
    /// The request `opcode`, if it exists
    pub fn request(&self, opcode: u32) -> Option<&'static MessageDesc> {
        self.requests.get(opcode as usize)
    }

    /// The event `opcode`, if it exists
    pub fn event(&self, opcode: u32) -> Option<&'static MessageDesc> {
        self.events.get(opcode as usize)
    }
}

impl std::fmt::Display for Interface {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// One request or event of an [`Interface`]
#[derive(Copy, Clone, Debug)]
pub struct MessageDesc {
    /// Message name, used to bind handlers and in debug output
    pub name: &'static str,
    /// Argument types, in order
    pub signature: &'static [ArgumentType],
    /// First interface version carrying this message
    pub since: u32,
    /// Receiving this message destroys the object
    pub is_destructor: bool,
    /// Interface of the object created by the `n` argument
    pub child_interface: Option<&'static Interface>,
    /// Expected interface of each `o` argument, in order; empty when unchecked
    pub arg_interfaces: &'static [&'static Interface],
}

/// Placeholder for object arguments whose interface is only known at runtime
pub static ANONYMOUS_INTERFACE: Interface =
    Interface { name: "<anonymous>", version: 0, requests: &[], events: &[] };

/// Error codes of the `wl_display.error` enum, usable on any object
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisplayError {
    /// The object does not exist
    InvalidObject = 0,
    /// The method does not exist or its arguments are invalid
    InvalidMethod = 1,
    /// The server is out of memory
    NoMemory = 2,
    /// The implementation failed
    Implementation = 3,
}

/// Fatal error a server raised on a client connection (`wl_display.error`)
///
/// The connection is unusable once it is received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolError {
    /// Error code, from the error enum of `object_interface` or from [`DisplayError`]
    pub code: u32,
    /// Protocol id of the object the error was raised on
    pub object_id: u32,
    /// Interface name of that object
    pub object_interface: String,
    /// Human readable description
    pub message: String,
}

impl std::error::Error for ProtocolError {}

impl std::fmt::Display for ProtocolError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { code, object_id, object_interface, message } = self;
        write!(f, "{object_interface}@{object_id}: error {code}: {message}")
    }
}

/// Arguments kept on the stack by argument lists before spilling to the heap
pub const INLINE_ARGS: usize = 4;

/// First protocol id of the server-allocated range
pub const SERVER_ID_LIMIT: u32 = 0xFF00_0000;

/// Whether `a` and `b` describe the same interface
///
/// Tables are compared by name when they are distinct statics.
pub fn same_interface(a: &'static Interface, b: &'static Interface) -> bool {
    std::ptr::eq(a, b) || a.name == b.name
}
