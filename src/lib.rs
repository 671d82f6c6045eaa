//! Previewgate - on-demand preview hosting for many tenants
//!
//! This library builds and serves one preview site per tenant:
//! - Renders a shared template tree into a per-tenant site directory
//! - Starts each site as a supervised child process on a pooled local port
//! - Stops idle sites after a configurable timeout
//! - Publishes reverse-proxy rules so every running site has a public hostname
//! - Reconciles durable site records against live processes and rule files

pub mod admin;
pub mod binder;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod ports;
pub mod proxy;
pub mod runtime;
pub mod supervisor;
pub mod tenants;
