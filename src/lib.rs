pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod ldap_protocol;
pub mod model;
pub mod operations;
pub mod result_code;
pub mod search;
pub mod sequencer;
pub mod tls;
pub mod value;

#[cfg(test)]
mod test_support;

pub use config::GatewayConfig;
pub use dispatcher::{BatchDispatcher, Credentials};
pub use error::{GatewayError, Result};
pub use model::{BatchRequest, BatchResponse, OperationRequest, OperationResponse};
pub use value::{FileUriResolver, UriResolver};
