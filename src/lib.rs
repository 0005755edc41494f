//! Floodgate - In-process Admission Control
//!
//! This crate guards request handlers with keyed token-bucket rate limiting
//! (per user, per API path and per client IP) and a circuit breaker per
//! endpoint. The [`admission::AdmissionMiddleware`] can be embedded directly
//! or reached over gRPC through the service in [`grpc`].

pub mod admission;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod path;
pub mod ratelimit;
