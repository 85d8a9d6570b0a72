//! HTTP client module for the target service
//!
//! Defines the target service contract and its reqwest implementation.

mod client;

pub use client::{GraphRagClient, ServiceError, ServiceResponse, TargetService};
