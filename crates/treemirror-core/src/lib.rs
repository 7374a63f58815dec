//! treemirror core - domain types, configuration and ports
//!
//! This crate holds everything the sync and supervision layers share:
//! - **Configuration** - the YAML-backed [`config::Config`] and the read-only
//!   [`config::ResolvedConfig`] a sync pass consumes
//! - **Domain types** - [`domain::ExternalId`], [`domain::FileDigest`],
//!   [`domain::RemoteFileRecord`], [`domain::DaemonRecord`]
//! - **Ports** - the [`ports::IRemoteStore`] trait implemented by the HTTP
//!   adapter and by in-memory fakes in tests
//!
//! Nothing here performs I/O beyond reading the configuration file.

pub mod config;
pub mod domain;
pub mod ports;
