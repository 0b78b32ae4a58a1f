//! # envtrace-core
//!
//! Safe building blocks for the envtrace audit shim.
//!
//! The shim itself (`envtrace-abi`) owns every raw pointer and every call into
//! the host libc. This crate holds what can be expressed without `unsafe`: the
//! fixed set of intercepted call kinds, the event record model and its one-line
//! text encoding, bounded reconstruction of list-form `exec` arguments, the
//! configuration constants and the error taxonomy.

#![deny(unsafe_code)]

pub mod arglist;
pub mod config;
pub mod error;
pub mod kind;
pub mod record;

pub use error::TraceError;
pub use kind::CallKind;
