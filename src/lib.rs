//! Client-side mirror of a moderation-record collection.
//!
//! A [`cache::TtlStore`] coalesces bulk fetches, an
//! [`application::repository::RecordRepository`] layers optimistic CRUD over
//! it, and a [`realtime::RealtimeChannel`] feeds push deltas into the same
//! in-memory view.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod realtime;
