#![cfg_attr(docsrs, feature(doc_cfg))]

//! Core engine of the Spin Cycle job-chain orchestration system.
//!
//! The crate has two halves that compose over the [`proto`] wire types:
//!
//! - The **graph compiler** (Request Manager side): [`spec`] parses
//!   declarative YAML sequences and statically validates them,
//!   [`template`] compiles each sequence into an immutable template graph
//!   with verified argument flow, and [`resolver`] expands a template plus
//!   request arguments into a runnable [`proto::JobChain`].
//! - The **traverser** (Job Runner side): [`chain`] wraps a job chain with
//!   runtime state and try counters, and its traverser walks the chain,
//!   running jobs through [`runner`] as their dependencies complete, with
//!   retry, cooperative stop, and suspend-for-resume semantics.
//!
//! Job implementations, transport, and persistence are external
//! collaborators, seen only through the [`job`] and [`client`] traits.

pub mod chain;
pub mod client;
pub mod job;
pub mod proto;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod spec;
pub mod template;
pub mod testing;

mod sync;

pub use sync::Interrupt;

#[cfg(feature = "logging")]
mod logging;

#[cfg(feature = "logging")]
pub use logging::init as init_logging;
