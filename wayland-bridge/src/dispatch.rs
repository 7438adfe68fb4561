//! Translation of native calls into handler invocations, and of outgoing calls into wire arguments
//!
//! Inbound messages (requests on the server, events on the client) are routed through an
//! [`Implementation`]: a table of handlers indexed by opcode, built once per interface. The
//! dispatcher never lets a handler failure cross back into the native library: it becomes a
//! protocol error posted to the remote peer, or a logged failure code.

use std::{
    any::Any,
    borrow::Cow,
    fmt,
    os::unix::io::RawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use smallvec::SmallVec;

use crate::{
    codec,
    protocol::{
        AllowNull, Argument, ArgumentType, DisplayError, Fixed, Interface, MessageDesc, INLINE_ARGS,
    },
    registry::{ObjectRegistry, Peer},
    types::{BridgeError, NativeHandle},
};

/// An argument as seen by handlers
#[derive(Clone)]
pub enum Value<'a> {
    /// An integer argument
    Int(i32),
    /// An unsigned integer argument
    Uint(u32),
    /// A fixed point number
    Fixed(Fixed),
    /// A string, `None` for a null string
    Str(Option<String>),
    /// An object, `None` for a null object
    Object(Option<Arc<dyn Peer>>),
    /// The protocol id of an object to create
    NewId(u32),
    /// An object created by the native library on reception, or by the sender of an event
    NewObject(NativeHandle),
    /// An array of bytes, borrowed from the native message when inbound
    Array(Cow<'a, [u8]>),
    /// A file descriptor
    Fd(RawFd),
}

impl<'a> Value<'a> {
    /// The integer value
    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }

    /// The unsigned integer value
    pub fn as_uint(&self) -> Option<u32> {
        match *self {
            Self::Uint(v) => Some(v),
            _ => None,
        }
    }

    /// The fixed point value
    pub fn as_fixed(&self) -> Option<Fixed> {
        match *self {
            Self::Fixed(v) => Some(v),
            _ => None,
        }
    }

    /// The string, `None` if this is not a non-null string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(Some(v)) => Some(v),
            _ => None,
        }
    }

    /// The object, `None` if this is not a non-null object
    pub fn as_object(&self) -> Option<&Arc<dyn Peer>> {
        match self {
            Self::Object(Some(v)) => Some(v),
            _ => None,
        }
    }

    /// The object as a concrete peer type
    pub fn as_object_of<T: Peer>(&self) -> Option<Arc<T>> {
        self.as_object()?.clone().downcast_arc::<T>().ok()
    }

    /// The protocol id of the object to create
    pub fn as_new_id(&self) -> Option<u32> {
        match *self {
            Self::NewId(v) => Some(v),
            _ => None,
        }
    }

    /// The native object already created
    pub fn as_new_object(&self) -> Option<NativeHandle> {
        match *self {
            Self::NewObject(v) => Some(v),
            _ => None,
        }
    }

    /// The array contents
    pub fn as_array(&self) -> Option<&[u8]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    /// The file descriptor
    pub fn as_fd(&self) -> Option<RawFd> {
        match *self {
            Self::Fd(v) => Some(v),
            _ => None,
        }
    }

    /// Detach the value from the native buffers it borrows
    pub fn into_owned(self) -> Value<'static> {
        match self {
            Self::Int(v) => Value::Int(v),
            Self::Uint(v) => Value::Uint(v),
            Self::Fixed(v) => Value::Fixed(v),
            Self::Str(v) => Value::Str(v),
            Self::Object(v) => Value::Object(v),
            Self::NewId(v) => Value::NewId(v),
            Self::NewObject(v) => Value::NewObject(v),
            Self::Array(v) => Value::Array(Cow::Owned(v.into_owned())),
            Self::Fd(v) => Value::Fd(v),
        }
    }
}

fn peer_addr(peer: &Arc<dyn Peer>) -> *const () {
    Arc::as_ptr(peer) as *const ()
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Uint(a), Self::Uint(b)) => a == b,
            (Self::Fixed(a), Self::Fixed(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => match (a, b) {
                (Some(a), Some(b)) => peer_addr(a) == peer_addr(b),
                (None, None) => true,
                _ => false,
            },
            (Self::NewId(a), Self::NewId(b)) => a == b,
            (Self::NewObject(a), Self::NewObject(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Fd(a), Self::Fd(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value<'_> {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Uint(v) => write!(f, "Uint({v})"),
            Self::Fixed(v) => write!(f, "Fixed({v})"),
            Self::Str(v) => write!(f, "Str({v:?})"),
            Self::Object(Some(v)) => write!(f, "Object({v:?})"),
            Self::Object(None) => f.write_str("Object(nil)"),
            Self::NewId(v) => write!(f, "NewId({v})"),
            Self::NewObject(v) => write!(f, "NewObject({v})"),
            Self::Array(v) => write!(f, "Array({v:?})"),
            Self::Fd(v) => write!(f, "Fd({v})"),
        }
    }
}

/// An outgoing call could not be translated, or an inbound message did not match its signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarshalError {
    /// The opcode does not exist in the interface
    InvalidOpcode {
        /// The opcode
        opcode: u32,
    },
    /// The number of arguments does not match the signature
    ArgumentCount {
        /// Number of arguments of the signature
        expected: usize,
        /// Number of arguments given
        found: usize,
    },
    /// The argument does not have the type of the signature
    TypeMismatch {
        /// Position of the argument
        index: usize,
    },
    /// A null value for an argument that is not nullable
    NullArgument {
        /// Position of the argument
        index: usize,
    },
    /// The object given as argument was destroyed
    DeadObject {
        /// Position of the argument
        index: usize,
    },
    /// The object received as argument has no peer
    UnknownObject {
        /// Position of the argument
        index: usize,
    },
    /// A string argument contains a nul byte
    InteriorNul {
        /// Position of the argument
        index: usize,
    },
}

impl MarshalError {
    /// The protocol error reported to the remote peer when an inbound message fails to translate
    pub fn protocol_code(&self) -> DisplayError {
        match self {
            Self::UnknownObject { .. } | Self::DeadObject { .. } => DisplayError::InvalidObject,
            _ => DisplayError::InvalidMethod,
        }
    }
}

impl std::error::Error for MarshalError {}

impl fmt::Display for MarshalError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOpcode { opcode } => write!(f, "invalid opcode {opcode}"),
            Self::ArgumentCount { expected, found } => {
                write!(f, "expected {expected} arguments, got {found}")
            }
            Self::TypeMismatch { index } => write!(f, "argument {index} has the wrong type"),
            Self::NullArgument { index } => write!(f, "argument {index} cannot be null"),
            Self::DeadObject { index } => write!(f, "object of argument {index} was destroyed"),
            Self::UnknownObject { index } => write!(f, "object of argument {index} is unknown"),
            Self::InteriorNul { index } => {
                write!(f, "string of argument {index} contains a nul byte")
            }
        }
    }
}

/// Failure of a handler
pub enum RequestError {
    /// The remote peer violated the protocol, the error is posted to it
    Protocol {
        /// Error code, from the error enum of the interface
        code: u32,
        /// Error description
        message: String,
    },
    /// The handler ran out of memory, the "no memory" error is posted to the remote peer
    NoMemory,
    /// Any other failure, logged by the dispatcher
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl RequestError {
    /// A protocol error with this code and message
    pub fn protocol(code: u32, message: impl Into<String>) -> Self {
        Self::Protocol { code, message: message.into() }
    }

    /// An unexpected failure
    pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(err.into())
    }
}

impl From<BridgeError> for RequestError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NoMemory => Self::NoMemory,
            err => Self::Failed(Box::new(err)),
        }
    }
}

impl fmt::Debug for RequestError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { code, message } => {
                f.debug_struct("Protocol").field("code", code).field("message", message).finish()
            }
            Self::NoMemory => f.write_str("NoMemory"),
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

impl fmt::Display for RequestError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { code, message } => write!(f, "protocol error {code}: {message}"),
            Self::NoMemory => f.write_str("out of memory"),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(err) => Some(&**err),
            _ => None,
        }
    }
}

/// A handler of one message
pub type Handler<P> =
    Box<dyn Fn(&Arc<P>, &[Value<'_>]) -> Result<(), RequestError> + Send + Sync + 'static>;

/// The handlers of the inbound messages of an interface, indexed by opcode
pub struct Implementation<P> {
    interface: &'static Interface,
    handlers: Vec<Option<Handler<P>>>,
}

impl<P: Dispatch> Implementation<P> {
    /// Start building the implementation of `interface`
    pub fn builder(interface: &'static Interface) -> ImplementationBuilder<P> {
        let count = P::inbound_messages(interface).len();
        ImplementationBuilder {
            interface,
            handlers: std::iter::repeat_with(|| None).take(count).collect(),
            error: None,
        }
    }

    /// An implementation without any handler
    ///
    /// Every inbound message is then refused with an `invalid_method` error.
    pub fn empty(interface: &'static Interface) -> Arc<Self> {
        Arc::new(Self { interface, handlers: Vec::new() })
    }
}

impl<P> Implementation<P> {
    /// The interface this implementation is for
    pub fn interface(&self) -> &'static Interface {
        self.interface
    }

    /// The handler of `opcode`
    pub fn handler(&self, opcode: u32) -> Option<&Handler<P>> {
        self.handlers.get(opcode as usize)?.as_ref()
    }
}

impl<P> fmt::Debug for Implementation<P> {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handled: Vec<usize> =
            self.handlers.iter().enumerate().filter(|(_, h)| h.is_some()).map(|(i, _)| i).collect();
        f.debug_struct("Implementation")
            .field("interface", &self.interface.name)
            .field("handled", &handled)
            .finish()
    }
}

/// Builder of an [`Implementation`]
///
/// Message names are resolved to opcodes when registered, a name unknown to the interface makes
/// [`build`](ImplementationBuilder::build) fail.
pub struct ImplementationBuilder<P> {
    interface: &'static Interface,
    handlers: Vec<Option<Handler<P>>>,
    error: Option<BridgeError>,
}

impl<P: Dispatch> ImplementationBuilder<P> {
    /// Handle the message named `name`
    pub fn on<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&Arc<P>, &[Value<'_>]) -> Result<(), RequestError> + Send + Sync + 'static,
    {
        match P::inbound_messages(self.interface).iter().position(|desc| desc.name == name) {
            Some(opcode) => self.on_opcode(opcode as u32, handler),
            None => self.fail(name.into()),
        }
    }

    /// Handle the message of opcode `opcode`
    pub fn on_opcode<F>(mut self, opcode: u32, handler: F) -> Self
    where
        F: Fn(&Arc<P>, &[Value<'_>]) -> Result<(), RequestError> + Send + Sync + 'static,
    {
        match self.handlers.get_mut(opcode as usize) {
            Some(slot) => {
                *slot = Some(Box::new(handler));
                self
            }
            None => self.fail(format!("#{opcode}")),
        }
    }

    fn fail(mut self, name: String) -> Self {
        if self.error.is_none() {
            self.error =
                Some(BridgeError::UnknownMessage { interface: self.interface.name, name });
        }
        self
    }

    /// Finish the implementation
    pub fn build(self) -> Result<Arc<Implementation<P>>, BridgeError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(Arc::new(Implementation { interface: self.interface, handlers: self.handlers })),
        }
    }
}

impl<P> fmt::Debug for ImplementationBuilder<P> {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationBuilder")
            .field("interface", &self.interface.name)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A peer that receives messages through an [`Implementation`]
pub trait Dispatch: Peer + Sized {
    /// The messages this kind of peer receives from `interface`
    fn inbound_messages(interface: &'static Interface) -> &'static [MessageDesc];

    /// The interface of the object
    fn interface(&self) -> &'static Interface;

    /// The protocol id of the object
    fn protocol_id(&self) -> u32;

    /// The handlers of the object
    fn implementation(&self) -> Option<Arc<Implementation<Self>>>;

    /// Report a protocol error to the remote peer
    fn post_error(&self, code: u32, message: &str);

    /// Report an out of memory condition to the remote peer
    fn post_no_memory(&self);

    /// Whether messages are printed for `WAYLAND_DEBUG`
    fn debug_messages(&self) -> bool {
        false
    }

    /// Called once the handler of a destructor message ran
    fn after_destructor(_peer: &Arc<Self>, _desc: &MessageDesc) {}
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

/// Run a handler, converting its failures
///
/// Returns 0 when the handler succeeded or failed with an error that was reported to the remote
/// peer, and -1 for failures that could only be logged.
pub(crate) fn run_guarded<F, E, N>(context: fmt::Arguments<'_>, handler: F, post_error: E, no_memory: N) -> i32
where
    F: FnOnce() -> Result<(), RequestError>,
    E: FnOnce(u32, &str),
    N: FnOnce(),
{
    match catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => 0,
        Ok(Err(RequestError::Protocol { code, message })) => {
            post_error(code, &message);
            0
        }
        Ok(Err(RequestError::NoMemory)) => {
            no_memory();
            0
        }
        Ok(Err(RequestError::Failed(err))) => {
            crate::log_error!("Handler of {} failed: {}", context, err);
            -1
        }
        Err(payload) => {
            crate::log_error!("Handler of {} panicked: {}", context, panic_message(&*payload));
            -1
        }
    }
}

/// Translate inbound wire arguments into values
///
/// Objects are looked up in `registry`, strings are copied, arrays are borrowed.
pub fn translate_inbound<'a>(
    registry: &ObjectRegistry,
    desc: &MessageDesc,
    args: &'a [Argument<'a>],
) -> Result<SmallVec<[Value<'a>; INLINE_ARGS]>, MarshalError> {
    if desc.signature.len() != args.len() {
        return Err(MarshalError::ArgumentCount { expected: desc.signature.len(), found: args.len() });
    }
    let mut values = SmallVec::with_capacity(args.len());
    for (index, (typ, arg)) in desc.signature.iter().copied().zip(args).enumerate() {
        let value = match (typ, arg) {
            (ArgumentType::Int, Argument::Int(v)) => Value::Int(*v),
            (ArgumentType::Uint, Argument::Uint(v)) => Value::Uint(*v),
            (ArgumentType::Fixed, Argument::Fixed(v)) => Value::Fixed(codec::fixed_from_native(*v)),
            (ArgumentType::Str(allow_null), Argument::Str(s)) => Value::Str(
                codec::optional_string_from_native(s.as_deref(), allow_null)
                    .map_err(|_| MarshalError::NullArgument { index })?,
            ),
            (ArgumentType::Object(allow_null), Argument::Object(handle)) => match handle {
                Some(handle) => Value::Object(Some(
                    registry.find(*handle).ok_or(MarshalError::UnknownObject { index })?,
                )),
                None if allow_null == AllowNull::Yes => Value::Object(None),
                None => return Err(MarshalError::NullArgument { index }),
            },
            (ArgumentType::NewId, Argument::NewId(id)) => Value::NewId(*id),
            (ArgumentType::NewId, Argument::NewObject(handle)) => Value::NewObject(*handle),
            (ArgumentType::Array, Argument::Array(data)) => Value::Array(Cow::Borrowed(&**data)),
            (ArgumentType::Fd, Argument::Fd(fd)) => Value::Fd(*fd),
            _ => return Err(MarshalError::TypeMismatch { index }),
        };
        values.push(value);
    }
    Ok(values)
}

/// Translate the values of an outgoing call into wire arguments
///
/// `messages` are the outbound messages of the interface (events for a server, requests for a
/// client).
pub fn marshal_call<'a>(
    messages: &[MessageDesc],
    opcode: u32,
    values: &'a [Value<'a>],
) -> Result<SmallVec<[Argument<'a>; INLINE_ARGS]>, MarshalError> {
    let desc = messages.get(opcode as usize).ok_or(MarshalError::InvalidOpcode { opcode })?;
    if desc.signature.len() != values.len() {
        return Err(MarshalError::ArgumentCount {
            expected: desc.signature.len(),
            found: values.len(),
        });
    }
    let mut args = SmallVec::with_capacity(values.len());
    for (index, (typ, value)) in desc.signature.iter().copied().zip(values).enumerate() {
        let arg = match (typ, value) {
            (ArgumentType::Int, Value::Int(v)) => Argument::Int(*v),
            (ArgumentType::Uint, Value::Uint(v)) => Argument::Uint(*v),
            (ArgumentType::Fixed, Value::Fixed(v)) => Argument::Fixed(codec::fixed_to_native(*v)),
            (ArgumentType::Str(allow_null), Value::Str(s)) => Argument::Str(
                codec::optional_string_to_native(s.as_deref(), allow_null)
                    .map_err(|err| match err {
                        codec::CodecError::NullString => MarshalError::NullArgument { index },
                        codec::CodecError::InteriorNul { .. } => MarshalError::InteriorNul { index },
                    })?
                    .map(Cow::Owned),
            ),
            (ArgumentType::Object(allow_null), Value::Object(peer)) => match peer {
                Some(peer) => Argument::Object(Some(
                    peer.native_handle().ok_or(MarshalError::DeadObject { index })?,
                )),
                None if allow_null == AllowNull::Yes => Argument::Object(None),
                None => return Err(MarshalError::NullArgument { index }),
            },
            (ArgumentType::NewId, Value::NewId(id)) => Argument::NewId(*id),
            (ArgumentType::NewId, Value::NewObject(handle)) => Argument::NewObject(*handle),
            (ArgumentType::Array, Value::Array(data)) => Argument::Array(Cow::Borrowed(&**data)),
            (ArgumentType::Fd, Value::Fd(fd)) => Argument::Fd(*fd),
            _ => return Err(MarshalError::TypeMismatch { index }),
        };
        args.push(arg);
    }
    Ok(args)
}

/// Dispatch an inbound message to the handler of the peer of `target`
///
/// Returns 0 if the message was handled (including when the handler reported a protocol error to
/// the remote peer), -1 otherwise. Failures are reported to the remote peer or logged, they never
/// propagate to the caller.
pub fn dispatch_request<P: Dispatch>(
    registry: &ObjectRegistry,
    target: NativeHandle,
    opcode: u32,
    args: &[Argument<'_>],
) -> i32 {
    let Some(peer) = registry.find_as::<P>(target) else {
        crate::log_error!("Received a message for {} which has no live peer", target);
        return -1;
    };
    let interface = peer.interface();
    let id = peer.protocol_id();

    let Some(desc) = P::inbound_messages(interface).get(opcode as usize) else {
        peer.post_error(
            DisplayError::InvalidMethod as u32,
            &format!("invalid method {}, object {}@{}", opcode, interface.name, id),
        );
        return -1;
    };

    if peer.debug_messages() {
        crate::debug::print_dispatched_message(interface.name, id, desc.name, args);
    }

    let values = match translate_inbound(registry, desc, args) {
        Ok(values) => values,
        Err(err) => {
            peer.post_error(
                err.protocol_code() as u32,
                &format!("{}@{}.{}: {}", interface.name, id, desc.name, err),
            );
            return -1;
        }
    };

    let Some(implementation) = peer.implementation() else {
        peer.post_error(
            DisplayError::InvalidMethod as u32,
            &format!("{}@{} has no implementation", interface.name, id),
        );
        return -1;
    };
    let Some(handler) = implementation.handler(opcode) else {
        peer.post_error(
            DisplayError::InvalidMethod as u32,
            &format!("method {}.{} is not implemented", interface.name, desc.name),
        );
        return -1;
    };

    let ret = run_guarded(
        format_args!("{}@{}.{}", interface.name, id, desc.name),
        || handler(&peer, &values[..]),
        |code, message| peer.post_error(code, message),
        || peer.post_no_memory(),
    );
    drop(values);

    if desc.is_destructor {
        P::after_destructor(&peer, desc);
    }
    ret
}
