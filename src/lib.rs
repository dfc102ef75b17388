//! hetzner-k8s: Cluster API infrastructure provider core for Hetzner
//!
//! This crate reconciles HCloud servers, their control plane load balancer and bare metal hosts
//! rented through the Hetzner Robot API, and remediates unhealthy machines by rebooting them.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod hcloud;
pub mod robot;
pub mod scope;
pub mod ssh;
pub mod telemetry;

pub use crate::error::{Error, Result};
