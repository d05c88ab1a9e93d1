//! Application services: the record repository, its reconciliation engine and
//! the collaborator traits they depend on.

pub mod error;
pub mod reconcile;
pub mod repos;
pub mod repository;
