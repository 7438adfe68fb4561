use std::{borrow::Cow, ffi::CString, sync::Arc};

use super::*;
use crate::{
    dispatch::{dispatch_request, marshal_call, translate_inbound, MarshalError},
    protocol::{Argument, DisplayError, Fixed},
    registry::Peer,
    types::{HandleKind, NativeHandle},
};

struct Dead;

impl Peer for Dead {
    fn native_handle(&self) -> Option<NativeHandle> {
        None
    }
}

fn many_args<'a>(first: Value<'a>, required: Option<&str>) -> Vec<Value<'a>> {
    vec![
        first,
        Value::Int(-3),
        Value::Fixed(Fixed::from_f64(1.5)),
        Value::Array(Cow::Borrowed(&[1, 2, 3])),
        Value::Str(required.map(Into::into)),
        Value::Str(None),
    ]
}

#[test]
fn outgoing_values_become_wire_arguments() {
    let values = many_args(Value::Uint(7), Some("hello"));
    let args = marshal_call(TEST_GLOBAL_INTERFACE.events, EV_MANY_ARGS, &values).unwrap();
    assert_eq!(args[0], Argument::Uint(7));
    assert_eq!(args[1], Argument::Int(-3));
    assert_eq!(args[2], Argument::Fixed(384));
    assert_eq!(args[3], Argument::Array(Cow::Borrowed(&[1, 2, 3])));
    assert_eq!(args[4], Argument::Str(Some(Cow::Owned(CString::new("hello").unwrap()))));
    assert_eq!(args[5], Argument::Str(None));

    let registry = ObjectRegistry::new();
    let desc = &TEST_GLOBAL_INTERFACE.events[EV_MANY_ARGS as usize];
    let values = translate_inbound(&registry, desc, &args).unwrap();
    assert_eq!(values[2].as_fixed(), Some(Fixed::from_f64(1.5)));
    assert_eq!(values[3].as_array(), Some(&[1u8, 2, 3][..]));
    assert_eq!(values[4].as_str(), Some("hello"));
    assert_eq!(values[5].as_str(), None);
}

#[test]
fn outgoing_values_are_checked() {
    let short = [Value::Uint(1)];
    assert_eq!(
        marshal_call(TEST_GLOBAL_INTERFACE.events, EV_MANY_ARGS, &short).unwrap_err(),
        MarshalError::ArgumentCount { expected: 6, found: 1 }
    );

    let wrong_type = many_args(Value::Int(1), Some("x"));
    assert_eq!(
        marshal_call(TEST_GLOBAL_INTERFACE.events, EV_MANY_ARGS, &wrong_type).unwrap_err(),
        MarshalError::TypeMismatch { index: 0 }
    );

    let null = many_args(Value::Uint(1), None);
    assert_eq!(
        marshal_call(TEST_GLOBAL_INTERFACE.events, EV_MANY_ARGS, &null).unwrap_err(),
        MarshalError::NullArgument { index: 4 }
    );

    let nul_byte = many_args(Value::Uint(1), Some("a\0b"));
    assert_eq!(
        marshal_call(TEST_GLOBAL_INTERFACE.events, EV_MANY_ARGS, &nul_byte).unwrap_err(),
        MarshalError::InteriorNul { index: 4 }
    );

    assert_eq!(
        marshal_call(TEST_GLOBAL_INTERFACE.events, 42, &[]).unwrap_err(),
        MarshalError::InvalidOpcode { opcode: 42 }
    );
}

#[test]
fn destroyed_objects_cannot_be_sent() {
    let dead: Arc<dyn Peer> = Arc::new(Dead);
    let values = [Value::Object(Some(dead))];
    let err = marshal_call(TEST_GLOBAL_INTERFACE.requests, REQ_LINK, &values).unwrap_err();
    assert_eq!(err, MarshalError::DeadObject { index: 0 });
    assert_eq!(err.protocol_code(), DisplayError::InvalidObject);

    let values = [Value::Object(None)];
    let args = marshal_call(TEST_GLOBAL_INTERFACE.requests, REQ_LINK, &values).unwrap();
    assert_eq!(args[0], Argument::Object(None));
}

#[test]
fn inbound_objects_resolve_through_the_registry() {
    let registry = ObjectRegistry::new();
    let desc = &TEST_GLOBAL_INTERFACE.requests[REQ_LINK as usize];
    let handle = NativeHandle::from_addr(HandleKind::Resource, 0x2000).unwrap();

    let args = [Argument::Object(Some(handle))];
    let err = translate_inbound(&registry, desc, &args).unwrap_err();
    assert_eq!(err, MarshalError::UnknownObject { index: 0 });
    assert_eq!(err.protocol_code(), DisplayError::InvalidObject);

    let args = [Argument::Object(None)];
    let values = translate_inbound(&registry, desc, &args).unwrap();
    assert!(values[0].as_object().is_none());

    let args = [Argument::Uint(3)];
    let err = translate_inbound(&registry, desc, &args).unwrap_err();
    assert_eq!(err.protocol_code(), DisplayError::InvalidMethod);
}

#[test]
fn implementations_resolve_message_names() {
    let implementation = Implementation::<Resource>::builder(&TEST_GLOBAL_INTERFACE)
        .on("fail", |_, _| Ok(()))
        .on_opcode(REQ_DESTROY, |_, _| Ok(()))
        .build()
        .unwrap();
    assert!(implementation.handler(REQ_FAIL).is_some());
    assert!(implementation.handler(REQ_DESTROY).is_some());
    assert!(implementation.handler(REQ_LINK).is_none());
    assert!(implementation.handler(42).is_none());

    // events are not requests
    let err = Implementation::<Resource>::builder(&TEST_GLOBAL_INTERFACE)
        .on("spawned", |_, _| Ok(()))
        .build()
        .unwrap_err();
    match err {
        BridgeError::UnknownMessage { interface, name } => {
            assert_eq!(interface, "test_global");
            assert_eq!(name, "spawned");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let err = Implementation::<Proxy>::builder(&TEST_GLOBAL_INTERFACE)
        .on_opcode(7, |_, _| Ok(()))
        .build()
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnknownMessage { name, .. } if name == "#7"));
}

#[test]
fn messages_without_peer_are_refused() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = ObjectRegistry::new();
    let target = NativeHandle::from_addr(HandleKind::Resource, 0x3000).unwrap();
    assert_eq!(dispatch_request::<Resource>(&registry, target, REQ_FAIL, &[]), -1);
}

#[test]
fn bridge_errors_convert_to_request_errors() {
    assert!(matches!(RequestError::from(BridgeError::NoMemory), RequestError::NoMemory));
    assert!(matches!(RequestError::from(BridgeError::InvalidId), RequestError::Failed(_)));
}
