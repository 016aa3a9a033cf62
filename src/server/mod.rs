//! Transport bindings exposing a [`Dispatcher`](crate::dispatcher::Dispatcher).

pub mod http;

pub use self::http::{router, serve, serve_listener};
