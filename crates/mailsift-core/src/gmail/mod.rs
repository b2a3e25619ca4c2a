pub mod client;
pub mod oauth;
pub mod parser;
pub mod types;

pub use client::{GmailClient, GmailClientError};
pub use oauth::{NoopTokenStore, OAuthError, OAuthTokens, TokenStore};
