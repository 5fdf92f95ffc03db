//! Converge kernel : profils de configuration versionnés par organisation,
//! diff vers l'état réel des hôtes, génération de playbooks et dispatch
//! asynchrone avec suivi des acks.

pub mod config;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod http;
pub mod identity;
pub mod inventory;
pub mod models;
pub mod mqtt;
pub mod playbook;
pub mod schema;
pub mod store;

pub use error::{Error, Result};
