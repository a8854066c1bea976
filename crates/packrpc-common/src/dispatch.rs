//! Shared request invocation path.
//!
//! Both the client and server session loops feed decoded request frames
//! through [`handle_request`]: resolve the handler, decode the argument,
//! invoke, and produce the optional response frame. Dispatch failures
//! (`METHOD_UNDEFINED`, `PARAM_UNDEFINED`, reply serialization) drop the
//! frame and leave the session open; the remote caller, if it is waiting,
//! times out.

use std::any::Any;

use tracing::{debug, error, warn};

use crate::protocol::{Direction, Frame, PackrpcError};
use crate::registry::{CallContext, Registry};

/// Invoke the handler a request frame names.
///
/// Returns the response frame to write back, or `None` for fire-and-forget
/// handlers and for every dropped-frame failure mode.
pub fn handle_request(registry: &Registry, ctx: &CallContext, frame: &Frame) -> Option<Frame> {
    debug_assert_eq!(frame.direction, Direction::Request);

    let entry = match registry.lookup(&frame.method) {
        Some(entry) => entry,
        None => {
            let err = PackrpcError::MethodUndefined(frame.method.clone());
            warn!(serial = frame.serial, %err, "dropping frame");
            return None;
        }
    };

    let arg: Option<Box<dyn Any + Send>> = if frame.has_payload() {
        match registry.types().decode(&frame.arg_type, &frame.payload) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    method = %frame.method,
                    arg_type = %frame.arg_type,
                    %err,
                    "rpc argument decode failed, dropping frame"
                );
                return None;
            }
        }
    } else {
        None
    };

    match entry.invoke(ctx, arg) {
        Ok(Some(reply)) => Some(Frame::response(frame.method.clone(), frame.serial, Some(reply))),
        Ok(None) => None,
        Err(err) => {
            // No reply is sent; a waiting caller times out.
            error!(method = %frame.method, serial = frame.serial, %err, "rpc handler failed, dropping reply");
            None
        }
    }
}

/// Decode the payload of a response frame into an erased reply value.
///
/// A payload-less response decodes to the unit value, so argument-less
/// acknowledgements still wake the waiting caller.
pub fn decode_reply(registry: &Registry, frame: &Frame) -> Option<Box<dyn Any + Send>> {
    debug_assert_eq!(frame.direction, Direction::Response);

    if !frame.has_payload() {
        return Some(Box::new(()));
    }

    match registry.types().decode(&frame.arg_type, &frame.payload) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(
                method = %frame.method,
                arg_type = %frame.arg_type,
                %err,
                "rpc reply decode failed, dropping frame"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;

    use crate::registry::{marshal, CallContext, Message, ServiceBuilder};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        tag: u32,
    }

    impl Message for Ping {
        const TYPE_NAME: &'static str = "packrpc.test.Ping";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        tag: u32,
    }

    impl Message for Pong {
        const TYPE_NAME: &'static str = "packrpc.test.Pong";
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                ServiceBuilder::new("Svc")
                    .method("Echo", |_ctx, ping: Ping| Pong { tag: ping.tag })
                    .method_no_reply("Swallow", |_ctx, _ping: Ping| {})
                    .build(),
            )
            .unwrap();
        registry
    }

    fn ctx() -> CallContext {
        let (tx, _rx) = mpsc::channel(1);
        CallContext::new(9, None, tx)
    }

    #[test]
    fn request_produces_matching_response_frame() {
        let registry = registry();
        let request = Frame::request("Svc.Echo", 17, Some(marshal(&Ping { tag: 4 }).unwrap()));

        let reply = handle_request(&registry, &ctx(), &request).unwrap();
        assert_eq!(reply.direction, Direction::Response);
        assert_eq!(reply.serial, 17);
        assert_eq!(reply.method, "Svc.Echo");
        assert_eq!(reply.arg_type, Pong::TYPE_NAME);
        assert_eq!(serde_json::from_slice::<Pong>(&reply.payload).unwrap(), Pong { tag: 4 });
    }

    #[test]
    fn no_reply_handler_emits_no_frame() {
        let registry = registry();
        let request = Frame::request("Svc.Swallow", 0, Some(marshal(&Ping { tag: 1 }).unwrap()));
        assert!(handle_request(&registry, &ctx(), &request).is_none());
    }

    #[test]
    fn unknown_method_is_dropped() {
        let registry = registry();
        let request = Frame::request("Nope.X", 3, Some(marshal(&Ping { tag: 1 }).unwrap()));
        assert!(handle_request(&registry, &ctx(), &request).is_none());
    }

    #[test]
    fn unknown_arg_type_is_dropped() {
        let registry = registry();
        let request = Frame::request("Svc.Echo", 3, Some(("no.such.Type".to_string(), b"{}".to_vec())));
        assert!(handle_request(&registry, &ctx(), &request).is_none());
    }

    #[test]
    fn reply_decode_produces_typed_value() {
        let mut registry = registry();
        registry.ensure_type::<Pong>();
        let response = Frame::response("Svc.Echo", 5, Some(marshal(&Pong { tag: 8 }).unwrap()));

        let value = decode_reply(&registry, &response).unwrap();
        assert_eq!(*value.downcast::<Pong>().unwrap(), Pong { tag: 8 });
    }

    #[test]
    fn payload_less_reply_decodes_to_unit() {
        let registry = registry();
        let response = Frame::response("Svc.Swallow", 5, None);
        let value = decode_reply(&registry, &response).unwrap();
        assert!(value.downcast::<()>().is_ok());
    }

    #[test]
    fn unknown_reply_type_is_dropped() {
        let registry = registry();
        let response = Frame::response("Svc.Echo", 5, Some(("no.such.Type".to_string(), b"{}".to_vec())));
        assert!(decode_reply(&registry, &response).is_none());
    }
}
