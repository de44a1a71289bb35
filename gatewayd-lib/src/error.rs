//! Top-level error union: startup errors are fatal, per-tick and per-request
//! errors are logged and absorbed by the caller.

use thiserror::Error;

use crate::{auth_client, client_table, config, firewall};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] config::Error),
    #[error("transient network error: {0}")]
    NetworkTransient(String),
    #[error("fatal network error: {0}")]
    NetworkFatal(String),
    #[error("auth server denied the client")]
    AuthVerdictDenied,
    #[error("transient firewall error: {0}")]
    FirewallTransient(String),
    #[error("fatal firewall error: {0}")]
    FirewallFatal(#[from] firewall::Error),
    #[error("client not found")]
    ClientNotFound,
    #[error("client already exists with a conflicting key")]
    ClientDuplicate,
}

impl From<client_table::Error> for Error {
    fn from(e: client_table::Error) -> Self {
        match e {
            client_table::Error::NotFound => Error::ClientNotFound,
            client_table::Error::TokenConflict => Error::ClientDuplicate,
        }
    }
}

impl From<auth_client::Error> for Error {
    fn from(e: auth_client::Error) -> Self {
        match e {
            auth_client::Error::Connect(msg) => Error::NetworkTransient(msg),
            auth_client::Error::Response(msg) => Error::NetworkTransient(msg),
        }
    }
}
