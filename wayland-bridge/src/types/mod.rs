mod error;
mod handle;

pub use error::{BridgeError, InvalidId, NativeError};
pub use handle::{HandleKind, ListenerToken, NativeHandle};
