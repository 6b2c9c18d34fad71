//! Subgate - A subdomain-routing reverse proxy for self-hosted services
//!
//! This library provides a local-first reverse proxy that:
//! - Routes HTTP traffic by subdomain to services on localhost ports
//! - Keeps a persistent project registry with file watching and backups
//! - Discovers running services by port scanning and framework sniffing
//! - Gates routing on periodic health checks with history and uptime stats
//! - Relays websocket upgrades to the upstream after the 101 handshake
//! - Uses connection pooling for efficient upstream communication
//! - Manages wildcard TLS certificates via ACME DNS-01 or self-signed pairs

pub mod acme;
pub mod api;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod stats;
