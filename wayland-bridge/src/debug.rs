//! `WAYLAND_DEBUG` support: messages crossing the bridge are printed to stderr the way libwayland
//! prints its own.

use std::{
    fmt::Display,
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::protocol::Argument;

/// Which half of the protocol a message belongs to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Server,
    Client,
}

fn parse_debug_env(value: Option<&std::ffi::OsStr>) -> (bool, bool) {
    match value.and_then(|v| v.to_str()) {
        Some("1") => (true, true),
        Some("server") => (true, false),
        Some("client") => (false, true),
        _ => (false, false),
    }
}

/// Whether `WAYLAND_DEBUG` asks for messages of this side to be printed
///
/// The variable is read once per process.
pub(crate) fn has_debug_env(side: Side) -> bool {
    static FLAGS: OnceLock<(bool, bool)> = OnceLock::new();
    let (server, client) =
        *FLAGS.get_or_init(|| parse_debug_env(std::env::var_os("WAYLAND_DEBUG").as_deref()));
    match side {
        Side::Server => server,
        Side::Client => client,
    }
}

/// Print a message received by `interface@id`, as `[time][bridge] <- wl_foo@3.bar(args)`
#[cfg_attr(unstable_coverage, coverage(off))]
pub(crate) fn print_dispatched_message(interface: &str, id: u32, name: &str, args: &[Argument<'_>]) {
    eprintln!("{} <- {interface}@{id}.{name}({})", Timestamp::now(), ArgList(args));
}

/// Print a message sent by `interface@id`, as `[time][bridge] -> wl_foo@3.bar(args)`
#[cfg_attr(unstable_coverage, coverage(off))]
pub(crate) fn print_send_message(interface: &str, id: u32, name: &str, args: &[Argument<'_>]) {
    eprintln!("{} -> {interface}@{id}.{name}({})", Timestamp::now(), ArgList(args));
}

struct ArgList<'a, 'b>(&'a [Argument<'b>]);

impl Display for ArgList<'_, '_> {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        Ok(())
    }
}

/// Wall clock in microseconds, wrapped to 32 bits the way libwayland prints it
struct Timestamp(Option<u32>);

impl Timestamp {
    fn now() -> Self {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).ok();
        Self(since_epoch.map(|t| (t.as_secs() * 1_000_000 + u64::from(t.subsec_micros())) as u32))
    }
}

impl Display for Timestamp {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(micros) => write!(f, "[{:7}.{:03}][bridge]", micros / 1000, micros % 1000),
            None => f.write_str("[bridge]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn debug_env_values() {
        assert_eq!(parse_debug_env(Some(OsStr::new("1"))), (true, true));
        assert_eq!(parse_debug_env(Some(OsStr::new("server"))), (true, false));
        assert_eq!(parse_debug_env(Some(OsStr::new("client"))), (false, true));
        assert_eq!(parse_debug_env(Some(OsStr::new("0"))), (false, false));
        assert_eq!(parse_debug_env(None), (false, false));
    }

    #[test]
    fn args_are_comma_separated() {
        let args = [Argument::Uint(3), Argument::Str(None), Argument::Object(None)];
        assert_eq!(ArgList(&args).to_string(), "3, nil, nil");
        assert_eq!(ArgList(&[]).to_string(), "");
    }
}
