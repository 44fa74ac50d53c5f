//! Tollgate - Per-key Admission Control
//!
//! This crate implements fixed-window admission control: each caller-chosen
//! key gets a bounded number of admitted requests per window, and denied
//! callers get a retry hint. The controller is an explicit object shared by
//! request handlers, with an optional gRPC front end for out-of-process use.

pub mod admission;
pub mod config;
pub mod error;
pub mod grpc;
