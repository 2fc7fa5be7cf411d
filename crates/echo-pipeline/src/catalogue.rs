// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Operation catalogue: the injected registry of instruction types.
//!
//! Each entry pairs a pure resource-identifier function with an async
//! handler, plus optional validation, priority and timeout hints. The
//! catalogue is handed to the pipeline at construction and is immutable
//! afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::error::{CatalogueError, HandlerError};
use crate::ident::ResourceId;
use crate::instruction::InstructionContext;

/// Future returned by an operation handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// Future returned by an operation's pre-check.
pub type ValidateFuture = BoxFuture<'static, bool>;

/// One instruction type.
pub trait Operation: Send + Sync + 'static {
    /// Resources the instruction touches. Must be pure and stable for a
    /// given payload.
    fn resource_ids(&self, payload: &Value) -> Vec<ResourceId>;

    /// Runs the operation.
    fn execute(&self, payload: Value, context: InstructionContext) -> HandlerFuture;

    /// Optional pre-check run before any side effect. `None` skips it.
    fn validate(&self, _payload: &Value, _context: &InstructionContext) -> Option<ValidateFuture> {
        None
    }

    /// Scheduling priority; higher issues first among pending instructions.
    fn priority(&self) -> i32 {
        0
    }

    /// Per-instruction handler timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

type ResourceFn = dyn Fn(&Value) -> Vec<ResourceId> + Send + Sync;
type HandlerFn = dyn Fn(Value, InstructionContext) -> HandlerFuture + Send + Sync;
type ValidateFn = dyn Fn(&Value, &InstructionContext) -> ValidateFuture + Send + Sync;

/// [`Operation`] assembled from closures.
pub struct FnOperation {
    resources: Box<ResourceFn>,
    handler: Box<HandlerFn>,
    validator: Option<Box<ValidateFn>>,
    priority: i32,
    timeout: Option<Duration>,
}

impl FnOperation {
    /// Creates an operation from a resource function and an async handler.
    pub fn new<R, H, Fut>(resources: R, handler: H) -> Self
    where
        R: Fn(&Value) -> Vec<ResourceId> + Send + Sync + 'static,
        H: Fn(Value, InstructionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self {
            resources: Box::new(resources),
            handler: Box::new(move |payload: Value, ctx: InstructionContext| {
                handler(payload, ctx).boxed()
            }),
            validator: None,
            priority: 0,
            timeout: None,
        }
    }

    /// Adds an async pre-check.
    pub fn with_validator<V, Fut>(mut self, validator: V) -> Self
    where
        V: Fn(&Value, &InstructionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.validator = Some(Box::new(
            move |payload: &Value, ctx: &InstructionContext| validator(payload, ctx).boxed(),
        ));
        self
    }

    /// Sets the priority hint.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the timeout hint.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for FnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("validated", &self.validator.is_some())
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Operation for FnOperation {
    fn resource_ids(&self, payload: &Value) -> Vec<ResourceId> {
        (self.resources)(payload)
    }

    fn execute(&self, payload: Value, context: InstructionContext) -> HandlerFuture {
        (self.handler)(payload, context)
    }

    fn validate(&self, payload: &Value, context: &InstructionContext) -> Option<ValidateFuture> {
        self.validator.as_ref().map(|v| v(payload, context))
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Registry of operations keyed by type name.
#[derive(Clone, Default)]
pub struct Catalogue {
    operations: BTreeMap<String, Arc<dyn Operation>>,
}

impl fmt::Debug for Catalogue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalogue")
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Catalogue {
    /// Creates an empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `operation` under `name`.
    pub fn register<O>(&mut self, name: impl Into<String>, operation: O) -> Result<(), CatalogueError>
    where
        O: Operation,
    {
        self.register_shared(name, Arc::new(operation))
    }

    /// Registers an already shared operation under `name`.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        operation: Arc<dyn Operation>,
    ) -> Result<(), CatalogueError> {
        let name = name.into();
        if name.is_empty() {
            return Err(CatalogueError::EmptyName);
        }
        if self.operations.contains_key(&name) {
            return Err(CatalogueError::DuplicateOperation(name));
        }
        self.operations.insert(name, operation);
        Ok(())
    }

    /// Builder-style [`Catalogue::register`].
    pub fn with<O>(mut self, name: impl Into<String>, operation: O) -> Result<Self, CatalogueError>
    where
        O: Operation,
    {
        self.register(name, operation)?;
        Ok(self)
    }

    /// Looks up an operation.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Operation>> {
        self.operations.get(name)
    }

    /// Registered type names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
