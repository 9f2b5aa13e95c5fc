// Session & delivery engine for the chat gateway.
//
// The engine is protocol-agnostic: the concrete chat client implements
// `transport::ChatTransport` and is handed to `worker::run` by the
// deployment binary. Sessions, queues, fan-out, signed webhook dispatch
// and reconnect policy all live here.

pub mod auth_store;
pub mod config;
pub mod inbound;
pub mod models;
pub mod normalizer;
pub mod ops;
pub mod outbound;
pub mod queue;
pub mod schema;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod transport;
pub mod vault;
pub mod webhook;
pub mod worker;
