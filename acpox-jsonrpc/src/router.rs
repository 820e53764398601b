//! Dispatch of decoded inbound calls and notifications to the handlers registered for them.
//!
//! A [`Router`] is keyed on nothing but the method name.  It also decides which inbound messages
//! must be handled strictly in arrival order, via an optional ordering scope function.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use crate::handler::{ErasedHandler, Handler, InvocationRequest, MethodName, erase_handler};
use crate::types::{ErrorDetails, Response};

type HandlerTable<S> = Arc<RwLock<HashMap<String, Arc<dyn ErasedHandler<S>>>>>;

/// Maps an inbound method name and its params to the ordering scope it belongs to, if any.
///
/// Inbound messages in the same scope are handled one at a time, in the order they arrived.
/// Everything else runs concurrently.
pub type OrderingScopeFn = Arc<dyn Fn(&str, Option<&JsonValue>) -> Option<String> + Send + Sync>;

/// Method-name dispatch table for everything the remote peer sends us, plus the state shared by
/// all of the handlers in it.
///
/// Cloning a router is cheap, and clones share their handler table.
#[derive(Clone)]
pub struct Router<S: Clone + Send + Sync + 'static = ()> {
    state: S,
    unknown_method: Arc<dyn ErasedHandler<S>>,
    table: HandlerTable<S>,
    ordering_scope: Option<OrderingScopeFn>,
}

impl Router {
    /// Router for handlers that take no [`crate::State`]
    pub fn new_stateless() -> Router<()> {
        Router::new_with_state(())
    }
}

async fn reject_unknown_method(MethodName(name): MethodName) -> ErrorDetails {
    ErrorDetails::method_not_found(format!("Unknown method '{name}'"), None)
}

impl<S: Clone + Send + Sync + 'static> Router<S> {
    /// Router whose handlers can extract `state` with [`crate::State`]
    pub fn new_with_state(state: S) -> Self {
        Self {
            state,
            unknown_method: erase_handler(reject_unknown_method),
            table: Default::default(),
            ordering_scope: None,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Replace the handler that answers method calls nobody registered a handler for.  By default
    /// that's a `Method not found` error.
    ///
    /// Notifications with no registered handler never reach the fallback; they are ignored.
    pub fn register_fallback_handler<HackT, H>(&mut self, handler: H)
    where
        H: Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        self.unknown_method = erase_handler(handler);
    }

    /// Register the handler for a method, replacing any handler previously registered for it.
    pub fn register_handler<H, HackT>(&mut self, method: impl Into<String>, handler: H)
    where
        H: Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        let name: String = method.into();
        let replaced = self
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), erase_handler(handler));
        if replaced.is_some() {
            tracing::debug!(method = %name, "Replaced previously registered handler");
        }
    }

    /// Install the function that assigns inbound messages to ordering scopes.
    pub fn set_ordering_scope<F>(&mut self, scope: F)
    where
        F: Fn(&str, Option<&JsonValue>) -> Option<String> + Send + Sync + 'static,
    {
        self.ordering_scope = Some(Arc::new(scope));
    }

    pub(crate) fn ordering_scope_for(&self, method: &str, params: Option<&JsonValue>) -> Option<String> {
        let scope = self.ordering_scope.as_ref()?;
        scope(method, params)
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.lookup(method).is_some()
    }

    fn lookup(&self, method: &str) -> Option<Arc<dyn ErasedHandler<S>>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Start handling an inbound message.
    ///
    /// `None` means there is nothing to run: a notification nobody handles.  Otherwise the future
    /// resolves to the response owed to the peer, which is `None` for notifications.
    pub(crate) fn handle_invocation(
        &self,
        invocation: InvocationRequest,
    ) -> Option<BoxFuture<'static, Option<Response>>> {
        let state = self.state.clone();
        let Some(id) = invocation.id.clone() else {
            let Some(handler) = self.lookup(&invocation.method) else {
                tracing::debug!(method = %invocation.method, "No handler for notification; ignoring it");
                return None;
            };
            return Some(handler.handle_notification(state, invocation).map(|()| None).boxed());
        };

        let handler = self
            .lookup(&invocation.method)
            .unwrap_or_else(|| self.unknown_method.clone());
        Some(
            handler
                .handle_method(state, invocation)
                .map(move |payload| Some(Response::new(id, payload)))
                .boxed(),
        )
    }
}
