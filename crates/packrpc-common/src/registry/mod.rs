//! The method registry and invocation layer.
//!
//! Handlers are registered once at startup through the typed
//! [`ServiceBuilder`] and looked up many times by dispatch under a
//! `class.method` key. Go-style runtime reflection is replaced by a
//! registry of erased closures: each method entry knows how to decode its
//! declared argument type and how to invoke its handler.

pub mod message;
pub mod service;

use std::collections::HashMap;

pub use message::{marshal, Message, TypeRegistry};
pub use service::{CallContext, MethodEntry, Service, ServiceBuilder};

use crate::protocol::{PackrpcError, Result};

/// Maps `class.method` names to handler entries and owns the type registry
/// that decodes their payloads.
///
/// Registration happens at startup; lookups may then run concurrently with
/// dispatch (callers wrap the registry in an `RwLock` and take read locks
/// on the hot path).
#[derive(Default)]
pub struct Registry {
    methods: HashMap<String, MethodEntry>,
    classes: Vec<String>,
    types: TypeRegistry,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Insert every method of `service` under `class.method` keys.
    ///
    /// Fails with `BadReceiver` when the service cannot act as a receiver:
    /// an empty class name, a class name containing the `.` separator, a
    /// service with no methods, or a class registered twice.
    pub fn register(&mut self, service: Service) -> Result<()> {
        if service.class.is_empty() {
            return Err(PackrpcError::BadReceiver("empty class name".to_string()));
        }
        if service.class.contains('.') {
            return Err(PackrpcError::BadReceiver(format!(
                "class name '{}' may not contain '.'",
                service.class
            )));
        }
        if service.methods.is_empty() {
            return Err(PackrpcError::BadReceiver(format!(
                "service '{}' has no methods",
                service.class
            )));
        }
        if self.classes.contains(&service.class) {
            return Err(PackrpcError::BadReceiver(format!(
                "class '{}' already registered",
                service.class
            )));
        }

        for (name, entry) in service.methods {
            self.methods.insert(format!("{}.{}", service.class, name), entry);
        }
        self.types.absorb(service.types);
        self.classes.push(service.class);

        Ok(())
    }

    /// Resolve a qualified `class.method` name.
    ///
    /// The name is split on the first `.`; missing or empty halves resolve
    /// to `None`.
    pub fn lookup(&self, qualified: &str) -> Option<&MethodEntry> {
        let (class, method) = qualified.split_once('.')?;
        if class.is_empty() || method.is_empty() {
            return None;
        }
        self.methods.get(qualified)
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Make sure the registry can decode `M`, registering a decoder if it
    /// is not present yet. Used by typed client calls for reply types.
    pub fn ensure_type<M: Message>(&mut self) {
        self.types.insert::<M>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ask {
        n: u32,
    }

    impl Message for Ask {
        const TYPE_NAME: &'static str = "packrpc.test.Ask";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Answer {
        n: u32,
    }

    impl Message for Answer {
        const TYPE_NAME: &'static str = "packrpc.test.Answer";
    }

    fn ctx() -> CallContext {
        let (tx, _rx) = mpsc::channel(1);
        CallContext::new(1, None, tx)
    }

    fn arithmetic() -> Service {
        ServiceBuilder::new("Arith")
            .method("Double", |_ctx, ask: Ask| Answer { n: ask.n * 2 })
            .method_no_reply("Discard", |_ctx, _ask: Ask| {})
            .build()
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = Registry::new();
        registry.register(arithmetic()).unwrap();

        assert!(registry.lookup("Arith.Double").is_some());
        assert!(registry.lookup("Arith.Discard").is_some());
        assert!(registry.lookup("Arith.Missing").is_none());
        assert!(registry.lookup("Other.Double").is_none());
    }

    #[test]
    fn lookup_requires_both_halves() {
        let mut registry = Registry::new();
        registry.register(arithmetic()).unwrap();

        assert!(registry.lookup("Arith").is_none());
        assert!(registry.lookup("Arith.").is_none());
        assert!(registry.lookup(".Double").is_none());
        assert!(registry.lookup("").is_none());
    }

    #[test]
    fn register_rejects_empty_class() {
        let service = ServiceBuilder::new("").method_empty("Nop", |_ctx| {}).build();
        assert!(matches!(
            Registry::new().register(service),
            Err(PackrpcError::BadReceiver(_))
        ));
    }

    #[test]
    fn register_rejects_dotted_class() {
        let service = ServiceBuilder::new("a.b").method_empty("Nop", |_ctx| {}).build();
        assert!(matches!(
            Registry::new().register(service),
            Err(PackrpcError::BadReceiver(_))
        ));
    }

    #[test]
    fn register_rejects_method_less_service() {
        let service = ServiceBuilder::new("Empty").build();
        assert!(matches!(
            Registry::new().register(service),
            Err(PackrpcError::BadReceiver(_))
        ));
    }

    #[test]
    fn register_rejects_duplicate_class() {
        let mut registry = Registry::new();
        registry.register(arithmetic()).unwrap();
        assert!(matches!(
            registry.register(arithmetic()),
            Err(PackrpcError::BadReceiver(_))
        ));
    }

    #[test]
    fn invoke_round_trips_through_erased_entry() {
        let mut registry = Registry::new();
        registry.register(arithmetic()).unwrap();

        let entry = registry.lookup("Arith.Double").unwrap();
        assert_eq!(entry.arg_type(), Some(Ask::TYPE_NAME));
        assert_eq!(entry.reply_type(), Some(Answer::TYPE_NAME));

        let arg = registry
            .types()
            .decode(Ask::TYPE_NAME, &serde_json::to_vec(&Ask { n: 21 }).unwrap())
            .unwrap();
        let (reply_type, reply_bytes) = entry.invoke(&ctx(), Some(arg)).unwrap().unwrap();
        assert_eq!(reply_type, Answer::TYPE_NAME);
        assert_eq!(
            serde_json::from_slice::<Answer>(&reply_bytes).unwrap(),
            Answer { n: 42 }
        );
    }

    #[test]
    fn invoke_without_reply_produces_none() {
        let mut registry = Registry::new();
        registry.register(arithmetic()).unwrap();

        let entry = registry.lookup("Arith.Discard").unwrap();
        let arg = registry
            .types()
            .decode(Ask::TYPE_NAME, &serde_json::to_vec(&Ask { n: 1 }).unwrap())
            .unwrap();
        assert!(entry.invoke(&ctx(), Some(arg)).unwrap().is_none());
    }

    #[test]
    fn invoke_with_missing_arg_fails() {
        let mut registry = Registry::new();
        registry.register(arithmetic()).unwrap();

        let entry = registry.lookup("Arith.Double").unwrap();
        assert!(matches!(
            entry.invoke(&ctx(), None),
            Err(PackrpcError::ParamUndefined(_))
        ));
    }

    #[test]
    fn ensure_type_registers_reply_decoder() {
        let mut registry = Registry::new();
        assert!(!registry.types().contains(Answer::TYPE_NAME));
        registry.ensure_type::<Answer>();
        assert!(registry.types().contains(Answer::TYPE_NAME));
    }
}
