//! Upstream registry access: challenge negotiation, credentials, tokens and
//! the read-only repository client used on cache misses.

pub mod challenge;
pub mod client;
pub mod credentials;
pub mod token;
pub mod transport;

pub use challenge::{Challenge, ChallengeManager, SimpleChallengeManager, parse_www_authenticate, ping};
pub use client::{RemoteRepository, manifest_accept_header};
pub use credentials::{CredentialStore, NamespaceCredentials, configure_auth};
pub use token::TokenHandler;
pub use transport::AuthorizingTransport;
