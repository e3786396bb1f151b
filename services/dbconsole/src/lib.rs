//! Database console service library crate.
//!
//! # Purpose
//! The per-user session, transaction and access-control core of a multi-user
//! database web console, plus the thin HTTP surface over it.
//!
//! # Notes
//! Requests flow `api` -> [`coordinator`] -> ([`access`], [`txn`]) ->
//! [`broker`] -> [`backend`]. Nothing below the coordinator knows about HTTP.
pub mod access;
pub mod api;
pub mod app;
pub mod auth;
pub mod backend;
pub mod broker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod observability;
pub mod sql;
pub mod txn;
