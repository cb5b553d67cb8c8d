pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http_client;
pub mod model;
pub mod native;
pub mod response;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod tokenizer;
#[cfg(test)]
pub mod test_util;
