//! A hardened DNS-over-HTTPS resolving front end: upstream pool management
//! with CN + public-key pinned TLS, a JSON/RFC 8484 DoH client, a TTL
//! answer cache, a UDP stub-resolver proxy, and a host name-service
//! adaptor for direct library use.
pub mod answer;
pub mod base64url;
pub mod cache;
pub mod config;
pub mod doh;
pub mod error;
pub mod nss;
pub mod proxy;
pub mod tls;
pub mod upstream;
pub mod wire;

pub use error::{HardDnsError, HardDnsResult};
