//! Handlers: the code that runs when the remote peer calls one of our methods or sends us a
//! notification.  In ACP this is how the agent streams session updates, asks for permission, and
//! reads or writes files on the client's side.
//!
//! Any `async fn` whose arguments are [`FromRequest`] extractors and whose return type is
//! [`IntoResponse`] is a [`Handler`], the same way axum treats handler functions.
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionHandle;
use crate::types;
use crate::JsonRpcError;

/// An inbound method call or notification, as presented to a handler.
pub struct InvocationRequest {
    /// `None` when this is a notification
    pub id: Option<types::Id>,
    pub method: String,
    pub params: Option<JsonValue>,

    /// Handle to the connection the request arrived on, so handlers can call back into the
    /// remote peer
    pub connection: ConnectionHandle,

    /// Signalled if the remote peer cancels the request or the connection shuts down
    pub cancellation_token: CancellationToken,
}

impl InvocationRequest {
    pub(crate) fn from_request_message(
        connection: ConnectionHandle,
        request: types::Request,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            id: Some(request.id),
            method: request.method,
            params: request.params,
            connection,
            cancellation_token,
        }
    }

    pub(crate) fn from_notification_message(
        connection: ConnectionHandle,
        notification: types::Notification,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            id: None,
            method: notification.method,
            params: notification.params,
            connection,
            cancellation_token,
        }
    }
}

/// Inspired by axum's `FromRequest` trait.
///
/// Requests here are already-decoded JSON so there's no body to consume, and any number of
/// extractors can look at the same request.
pub trait FromRequest<S>: Sized {
    /// Sent back to the peer in place of calling the handler when extraction fails
    type Rejection: IntoResponse;

    fn from_request(request: &InvocationRequest, state: &S) -> Result<Self, Self::Rejection>;
}

/// The parameters of the request, deserialized into `T`.
///
/// Missing params are treated as JSON `null`.
pub struct Params<T>(pub T);

impl<T: DeserializeOwned, S> FromRequest<S> for Params<T> {
    type Rejection = JsonRpcError;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = request.params.clone().unwrap_or_default();
        match T::deserialize(&raw) {
            Ok(params) => Ok(Params(params)),
            Err(source) => Err(JsonRpcError::DeserRequest {
                source,
                type_name: std::any::type_name::<T>(),
                request: raw,
            }),
        }
    }
}

/// The raw JSON params, or `null` if there weren't any
impl<S> FromRequest<S> for JsonValue {
    type Rejection = Infallible;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request.params.clone().unwrap_or_default())
    }
}

/// The router's shared state, cloned for each invocation.
pub struct State<S: Clone>(pub S);

impl<S: Clone> FromRequest<S> for State<S> {
    type Rejection = Infallible;

    fn from_request(_request: &InvocationRequest, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(state.clone()))
    }
}

/// Name of the method being invoked, mostly useful for fallback handlers
pub struct MethodName(pub String);

impl<S> FromRequest<S> for MethodName {
    type Rejection = Infallible;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.method.clone()))
    }
}

/// The request ID, or `None` when invoked as a notification
impl<S> FromRequest<S> for Option<types::Id> {
    type Rejection = Infallible;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request.id.clone())
    }
}

/// The request ID, for handlers that only make sense as method calls.
///
/// Invoked as a notification, extraction fails; with no response to carry the error, the handler
/// is silently skipped.
impl<S> FromRequest<S> for types::Id {
    type Rejection = types::ErrorDetails;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        request.id.clone().ok_or_else(|| {
            types::ErrorDetails::invalid_request("This method cannot be invoked as a notification", None)
        })
    }
}

/// Long-running handlers should watch this token; it's cancelled when the remote peer cancels
/// the request or the connection shuts down.
impl<S> FromRequest<S> for CancellationToken {
    type Rejection = Infallible;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request.cancellation_token.clone())
    }
}

impl<S> FromRequest<S> for ConnectionHandle {
    type Rejection = Infallible;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request.connection.clone())
    }
}

/// Anything a handler can return.
pub trait IntoResponse {
    fn into_response(self) -> types::ResponsePayload;
}

/// `Ok` is serialized into `result`; `Err` becomes the `error` object.
impl<T, E> IntoResponse for Result<T, E>
where
    T: Serialize,
    E: Into<types::ErrorDetails>,
{
    fn into_response(self) -> types::ResponsePayload {
        match self {
            Ok(value) => types::ResponsePayload::serialize_to_success(value),
            Err(e) => types::ResponsePayload::error(e),
        }
    }
}

/// A bare JSON value is always a successful `result`
impl IntoResponse for JsonValue {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::success(self)
    }
}

/// Notification handlers usually return nothing.  Should one be called as a method, the result is
/// `null`.
impl IntoResponse for () {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::success(JsonValue::Null)
    }
}

impl IntoResponse for JsonRpcError {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::error(self)
    }
}

impl IntoResponse for types::ErrorDetails {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::error(self)
    }
}

impl IntoResponse for Infallible {
    fn into_response(self) -> types::ResponsePayload {
        match self {}
    }
}

/// Return `T` serialized to JSON as a success response.
///
/// In the unlikely event that serialization to JSON fails, this will instead produce an error
/// response.
pub struct MethodResponse<T>(pub T);

impl<T> From<T> for MethodResponse<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T: Serialize> IntoResponse for MethodResponse<T> {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::serialize_to_success(self.0)
    }
}

/// Code registered to run for a method name.
///
/// The same handler serves both method calls and notifications of its method.  For a
/// notification there is nobody to answer, so whatever it returns is dropped.
///
/// `HackT` only exists so that the blanket impls over async functions can mention their argument
/// types; the router erases it.  `S` is the router's state type, which every handler on a router
/// shares whether it extracts the state or not.
pub trait Handler<HackT, S>: Clone + Send + Sync + Sized + 'static {
    fn handle_method(self, state: S, request: InvocationRequest) -> BoxFuture<'static, types::ResponsePayload>;

    fn handle_notification(self, state: S, request: InvocationRequest) -> BoxFuture<'static, ()>;
}

/// Argument extraction shared by the method and notification paths of the blanket [`Handler`]
/// impls.
trait ExtractArgs<HackT, S>: Clone + Send + Sync + Sized + 'static {
    type Args: Send + 'static;
    type Output: IntoResponse;
    type Fut: Future<Output = Self::Output> + Send + 'static;

    fn extract(state: &S, request: &InvocationRequest) -> Result<Self::Args, types::ResponsePayload>;

    fn invoke(self, args: Self::Args) -> Self::Fut;
}

/// Handlers that take no arguments at all
impl<F, Fut, S, Res> Handler<(), S> for F
where
    F: FnOnce() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    S: Send + Sync + 'static,
    Res: IntoResponse + 'static,
{
    fn handle_method(self, _state: S, _request: InvocationRequest) -> BoxFuture<'static, types::ResponsePayload> {
        self().map(IntoResponse::into_response).boxed()
    }

    fn handle_notification(self, _state: S, _request: InvocationRequest) -> BoxFuture<'static, ()> {
        self().map(|_| ()).boxed()
    }
}

/// Up to six extractors per handler, which is more than any handler here needs
#[rustfmt::skip]
macro_rules! for_each_arity {
    ($name:ident) => {
        $name!([], T1);
        $name!([T1], T2);
        $name!([T1, T2], T3);
        $name!([T1, T2, T3], T4);
        $name!([T1, T2, T3, T4], T5);
        $name!([T1, T2, T3, T4, T5], T6);
    };
}

macro_rules! impl_handler {
    (
        [$($ty:ident),*], $last:ident
    ) => {
        #[allow(non_snake_case)]
        impl<F, Fut, S, Res, $($ty,)* $last> ExtractArgs<($($ty,)* $last,), S> for F
        where
            F: FnOnce($($ty,)* $last,) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            S: Send + Sync + 'static,
            Res: IntoResponse + 'static,
            $( $ty: FromRequest<S> + Send + 'static, )*
            $last: FromRequest<S> + Send + 'static {
            type Args = ($($ty,)* $last,);
            type Output = Res;
            type Fut = Fut;

            fn extract(state: &S, request: &InvocationRequest) -> Result<Self::Args, types::ResponsePayload> {
                $(
                    let $ty = $ty::from_request(request, state).map_err(IntoResponse::into_response)?;
                )*
                let $last = $last::from_request(request, state).map_err(IntoResponse::into_response)?;
                Ok(($($ty,)* $last,))
            }

            fn invoke(self, ($($ty,)* $last,): Self::Args) -> Self::Fut {
                self($($ty,)* $last,)
            }
        }

        // Bounds repeated so a bad signature is reported against `Handler`
        #[allow(non_snake_case)]
        impl<F, Fut, S, Res, $($ty,)* $last> Handler<($($ty,)* $last,), S> for F
        where
            F: FnOnce($($ty,)* $last,) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            S: Send + Sync + 'static,
            Res: IntoResponse + 'static,
            $( $ty: FromRequest<S> + Send + 'static, )*
            $last: FromRequest<S> + Send + 'static {
            fn handle_method(self, state: S, request: InvocationRequest) -> BoxFuture<'static, types::ResponsePayload> {
                match <Self as ExtractArgs<($($ty,)* $last,), S>>::extract(&state, &request) {
                    Ok(args) => async move {
                        <Self as ExtractArgs<($($ty,)* $last,), S>>::invoke(self, args).await.into_response()
                    }
                    .boxed(),
                    Err(rejection) => futures::future::ready(rejection).boxed(),
                }
            }

            fn handle_notification(self, state: S, request: InvocationRequest) -> BoxFuture<'static, ()> {
                match <Self as ExtractArgs<($($ty,)* $last,), S>>::extract(&state, &request) {
                    Ok(args) => async move {
                        let _ = <Self as ExtractArgs<($($ty,)* $last,), S>>::invoke(self, args).await;
                    }
                    .boxed(),
                    Err(_) => {
                        tracing::debug!(method = %request.method,
                            "Notification params could not be extracted; notification ignored");
                        futures::future::ready(()).boxed()
                    }
                }
            }
        }
    };
}

for_each_arity!(impl_handler);

/// Object-safe [`Handler`] with `HackT` erased, so handlers of every signature fit in one table.
pub(crate) trait ErasedHandler<S>: Send + Sync + 'static {
    fn handle_method(&self, state: S, request: InvocationRequest) -> BoxFuture<'static, types::ResponsePayload>;

    fn handle_notification(&self, state: S, request: InvocationRequest) -> BoxFuture<'static, ()>;
}

struct Erased<H, HackT> {
    handler: H,
    _hack: PhantomData<fn() -> HackT>,
}

impl<H, HackT, S> ErasedHandler<S> for Erased<H, HackT>
where
    H: Handler<HackT, S>,
    HackT: 'static,
    S: 'static,
{
    fn handle_method(&self, state: S, request: InvocationRequest) -> BoxFuture<'static, types::ResponsePayload> {
        self.handler.clone().handle_method(state, request)
    }

    fn handle_notification(&self, state: S, request: InvocationRequest) -> BoxFuture<'static, ()> {
        self.handler.clone().handle_notification(state, request)
    }
}

pub(crate) fn erase_handler<HackT, S, H>(handler: H) -> Arc<dyn ErasedHandler<S>>
where
    H: Handler<HackT, S>,
    HackT: 'static,
    S: 'static,
{
    Arc::new(Erased {
        handler,
        _hack: PhantomData,
    })
}
