//! # freshet
//!
//! Rebuilds downstream container images in dependency order when upstream
//! content changes: a signed RPM advisory, a rebuilt parent image, a
//! finished compose.
//!
//! Inbound events are dispatched to [`handler`]s, which resolve candidate
//! builds, filter them through allow/block [`rules`], skip artifacts already
//! covered by earlier unreleased events ([`dedup`]), and record the build
//! tree through the [`scheduler`]. Builds are persisted behind the
//! [`store::Store`] seam, in Postgres ([`db`]) or in memory ([`storage`]).

pub mod clients;
pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod model;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod telemetry;
