//! Repository engine modules

pub mod acl;
pub mod cache;
pub mod config;
pub mod error;
pub mod keylock;
pub mod lock;
pub mod repository;
pub mod resource;
pub mod store;
pub mod uri;
