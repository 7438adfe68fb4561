//! Conversions between native byte buffers and Rust strings and slices
//!
//! Native strings are nul-terminated UTF-8 byte buffers, arrays are `(pointer, length)` pairs owned
//! by the native message. Nothing in here has lifetime concerns beyond the borrow of the native
//! buffer.

use std::{
    borrow::Cow,
    ffi::{CStr, CString},
};

use crate::protocol::{AllowNull, Fixed};

/// A value could not be converted for the native side
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// A null string was given where the protocol requires one
    NullString,
    /// The string contains a nul byte at this position, which a native string cannot carry
    InteriorNul {
        /// Byte offset of the nul byte
        position: usize,
    },
}

impl std::error::Error for CodecError {}

impl std::fmt::Display for CodecError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NullString => f.write_str("null string for a non-nullable argument"),
            Self::InteriorNul { position } => {
                write!(f, "string contains a nul byte at position {position}")
            }
        }
    }
}

/// Convert a Rust string into a native string
pub fn string_to_native(value: &str) -> Result<CString, CodecError> {
    CString::new(value).map_err(|e| CodecError::InteriorNul { position: e.nul_position() })
}

/// Convert an optional Rust string, enforcing nullability
pub fn optional_string_to_native(
    value: Option<&str>,
    allow_null: AllowNull,
) -> Result<Option<CString>, CodecError> {
    match (value, allow_null) {
        (Some(value), _) => string_to_native(value).map(Some),
        (None, AllowNull::Yes) => Ok(None),
        (None, AllowNull::No) => Err(CodecError::NullString),
    }
}

/// Convert a native string into a Rust string
///
/// Invalid UTF-8 sequences are replaced, the native library does not validate what peers send.
pub fn string_from_native(value: &CStr) -> String {
    value.to_string_lossy().into_owned()
}

/// Convert an optional native string, enforcing nullability
pub fn optional_string_from_native(
    value: Option<&CStr>,
    allow_null: AllowNull,
) -> Result<Option<String>, CodecError> {
    match (value, allow_null) {
        (Some(value), _) => Ok(Some(string_from_native(value))),
        (None, AllowNull::Yes) => Ok(None),
        (None, AllowNull::No) => Err(CodecError::NullString),
    }
}

/// Borrow a native array as a slice
///
/// A null pointer is the empty array.
///
/// # Safety
///
/// If `data` is not null, it must point to `len` initialized bytes that stay valid and unmodified
/// for `'a`.
pub unsafe fn array_from_native<'a>(data: *const u8, len: usize) -> Cow<'a, [u8]> {
    if data.is_null() || len == 0 {
        Cow::Borrowed(&[])
    } else {
        Cow::Borrowed(unsafe { std::slice::from_raw_parts(data, len) })
    }
}

/// Borrow a native string
///
/// # Safety
///
/// If `data` is not null, it must point to a nul-terminated buffer valid for `'a`.
pub unsafe fn str_from_native<'a>(data: *const std::os::raw::c_char) -> Option<Cow<'a, CStr>> {
    if data.is_null() {
        None
    } else {
        Some(Cow::Borrowed(unsafe { CStr::from_ptr(data) }))
    }
}

/// Build the message of a protocol error
///
/// Native error posting takes a printf-style format string, so `%` is escaped. Nul bytes cannot be
/// transported and are dropped.
pub fn error_message(message: &str) -> CString {
    let mut bytes = Vec::with_capacity(message.len());
    for b in message.bytes() {
        match b {
            0 => {}
            b'%' => bytes.extend_from_slice(b"%%"),
            b => bytes.push(b),
        }
    }
    // no nul byte can remain
    CString::new(bytes).unwrap_or_default()
}

/// Recover the text of an error message built by [`error_message`]
pub fn error_message_text(message: &CStr) -> String {
    string_from_native(message).replace("%%", "%")
}

/// Wrap a raw wire value as a fixed point number
pub fn fixed_from_native(raw: i32) -> Fixed {
    Fixed::from_raw(raw)
}

/// Raw wire value of a fixed point number
pub fn fixed_to_native(value: Fixed) -> i32 {
    value.into_raw()
}
