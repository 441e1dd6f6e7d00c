//! Home infrastructure portal: single sign-on, a Route Guard in front of every
//! page, a Capability Proxy for the few upstream actions the browser may
//! trigger, and a Status Aggregator for at-a-glance health.

pub mod ca;
pub mod cli;
pub mod config;
pub mod error;
pub mod guard;
pub mod oidc;
pub mod pages;
pub mod proxy;
pub mod server;
pub mod session;
pub mod status;
