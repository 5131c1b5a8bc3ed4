//! OAuth 2.0 authorization-code client core: pushed authorization requests
//! (RFC 9126), PKCE (RFC 7636), and DPoP-bound tokens (RFC 9449) against a
//! single configured authorization server. Transport and storage backends
//! plug in through [`http_client::HttpClient`] and [`store::TokenStore`].

pub mod config;
pub mod dpop;
pub mod error;
pub mod http_client;
pub mod jose;
pub mod pkce;
pub mod security;
pub mod session;
pub mod store;
pub mod types;

pub const FALLBACK_ALG: &str = "ES256";
