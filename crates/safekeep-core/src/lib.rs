//! Core library for `SafeKeep`.
//!
//! Contains the safe permission model, the safe registry, AppRole and AWS
//! role lifecycle management, the authorization engine, ownership transfer
//! and audit events. The secret store is reached only through the
//! [`store::SecretStoreClient`] trait; [`store::KvSecretStore`] implements it
//! over any `safekeep-storage` backend.
//!
//! Start from [`service::SafeKeep`], which wires every component from one
//! [`config::EngineConfig`] and one store.

pub mod approle;
pub mod audit;
pub mod audit_file;
pub mod authz;
pub mod aws;
pub mod binding;
pub mod config;
pub mod error;
pub mod policy;
pub mod principal;
mod record;
pub mod safe;
pub mod service;
pub mod store;
pub mod transfer;
pub mod upstream;

pub use error::{Error, ErrorKind};
pub use service::SafeKeep;
