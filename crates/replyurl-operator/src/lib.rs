//! replyurl-operator: Kubernetes controller for identity provider reply URL synchronization

pub mod config;
pub mod controllers;
pub mod filter;
pub mod graph;
pub mod health;
pub mod reconcile;
pub mod registry;
pub mod secrets;
pub mod sweep;

pub use config::ReplyURLSync;
pub use reconcile::Delta;
