pub mod cloud;
pub mod errors;
pub mod handlers;
pub mod listener;
pub mod logging;
pub mod metrics_server;
pub mod registry;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod tls;
pub mod wire;
