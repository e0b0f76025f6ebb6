//! HTTP/3 callback surface: settings, Extended CONNECT, and plain request
//! dispatch.

pub mod connect;
pub mod request;
pub mod settings;

pub use connect::{dispatch_connect, ConnectOutcome};
pub use request::{dispatch_request, Response};
pub use settings::{Setting, Settings};
