//! The call context handed to handlers and the typed service builder.

use std::any::Any;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::protocol::{Frame, PackrpcError, Result};
use crate::registry::message::{marshal, Message, TypeRegistry};

/// Context passed to every handler invocation.
///
/// Identifies the session the request arrived on and lets the handler push
/// fire-and-forget frames back to the same peer without going through the
/// dispatch layer.
pub struct CallContext {
    handle: u64,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Frame>,
}

impl CallContext {
    pub fn new(handle: u64, peer: Option<SocketAddr>, outbound: mpsc::Sender<Frame>) -> CallContext {
        CallContext { handle, peer, outbound }
    }

    /// Handle of the session the request arrived on.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a fire-and-forget request toward the peer of this session.
    ///
    /// Best-effort: fails with `ConnectionClosed` if the session's outbound
    /// mailbox is full or gone.
    pub fn post<M: Message>(&self, method: &str, msg: &M) -> Result<()> {
        let frame = Frame::request(method, 0, Some(marshal(msg)?));
        self.outbound
            .try_send(frame)
            .map_err(|_| PackrpcError::ConnectionClosed)
    }
}

type InvokeFn =
    Box<dyn Fn(&CallContext, Option<Box<dyn Any + Send>>) -> Result<Option<(String, Vec<u8>)>> + Send + Sync>;

/// One registered method: the declared argument and reply type names plus
/// the erased invocation closure.
pub struct MethodEntry {
    arg_type: Option<&'static str>,
    reply_type: Option<&'static str>,
    invoke: InvokeFn,
}

impl MethodEntry {
    pub fn arg_type(&self) -> Option<&'static str> {
        self.arg_type
    }

    pub fn reply_type(&self) -> Option<&'static str> {
        self.reply_type
    }

    /// Run the handler. Returns the serialized reply tuple when the handler
    /// produces one.
    pub fn invoke(
        &self,
        ctx: &CallContext,
        arg: Option<Box<dyn Any + Send>>,
    ) -> Result<Option<(String, Vec<u8>)>> {
        (self.invoke)(ctx, arg)
    }
}

/// A named group of methods produced by [`ServiceBuilder::build`], ready
/// for registration.
pub struct Service {
    pub(crate) class: String,
    pub(crate) methods: Vec<(String, MethodEntry)>,
    pub(crate) types: TypeRegistry,
}

impl Service {
    pub fn class(&self) -> &str {
        &self.class
    }
}

/// Builds a [`Service`] out of typed handler closures.
///
/// Each adapter erases the handler behind a uniform invoke closure and
/// records the argument type's decoder, so the receive path can turn wire
/// bytes back into the declared type.
///
/// ```
/// use packrpc_common::registry::{Message, ServiceBuilder};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Echo { text: String }
///
/// impl Message for Echo {
///     const TYPE_NAME: &'static str = "example.Echo";
/// }
///
/// let service = ServiceBuilder::new("Echoer")
///     .method("Echo", |_ctx, req: Echo| Echo { text: req.text })
///     .build();
/// assert_eq!(service.class(), "Echoer");
/// ```
pub struct ServiceBuilder {
    class: String,
    methods: Vec<(String, MethodEntry)>,
    types: TypeRegistry,
}

impl ServiceBuilder {
    pub fn new(class: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            class: class.into(),
            methods: Vec::new(),
            types: TypeRegistry::new(),
        }
    }

    /// A method taking an argument and returning a reply.
    pub fn method<A, R, F>(mut self, name: &str, f: F) -> ServiceBuilder
    where
        A: Message,
        R: Message,
        F: Fn(&CallContext, A) -> R + Send + Sync + 'static,
    {
        self.types.insert::<A>();
        let invoke: InvokeFn = Box::new(move |ctx, arg| {
            let arg = downcast_arg::<A>(arg)?;
            marshal(&f(ctx, arg)).map(Some)
        });
        self.push(name, Some(A::TYPE_NAME), Some(R::TYPE_NAME), invoke)
    }

    /// A method taking an argument and returning nothing. No response frame
    /// is produced for it.
    pub fn method_no_reply<A, F>(mut self, name: &str, f: F) -> ServiceBuilder
    where
        A: Message,
        F: Fn(&CallContext, A) + Send + Sync + 'static,
    {
        self.types.insert::<A>();
        let invoke: InvokeFn = Box::new(move |ctx, arg| {
            f(ctx, downcast_arg::<A>(arg)?);
            Ok(None)
        });
        self.push(name, Some(A::TYPE_NAME), None, invoke)
    }

    /// A method taking no argument and returning a reply.
    pub fn method_no_arg<R, F>(self, name: &str, f: F) -> ServiceBuilder
    where
        R: Message,
        F: Fn(&CallContext) -> R + Send + Sync + 'static,
    {
        let invoke: InvokeFn = Box::new(move |ctx, _arg| marshal(&f(ctx)).map(Some));
        self.push(name, None, Some(R::TYPE_NAME), invoke)
    }

    /// A method taking no argument and returning nothing.
    pub fn method_empty<F>(self, name: &str, f: F) -> ServiceBuilder
    where
        F: Fn(&CallContext) + Send + Sync + 'static,
    {
        let invoke: InvokeFn = Box::new(move |ctx, _arg| {
            f(ctx);
            Ok(None)
        });
        self.push(name, None, None, invoke)
    }

    pub fn build(self) -> Service {
        Service {
            class: self.class,
            methods: self.methods,
            types: self.types,
        }
    }

    fn push(
        mut self,
        name: &str,
        arg_type: Option<&'static str>,
        reply_type: Option<&'static str>,
        invoke: InvokeFn,
    ) -> ServiceBuilder {
        self.methods.push((
            name.to_string(),
            MethodEntry { arg_type, reply_type, invoke },
        ));
        self
    }
}

fn downcast_arg<A: Message>(arg: Option<Box<dyn Any + Send>>) -> Result<A> {
    let arg = arg.ok_or_else(|| PackrpcError::ParamUndefined(A::TYPE_NAME.to_string()))?;
    arg.downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| PackrpcError::ParamUndefined(A::TYPE_NAME.to_string()))
}
