//! The ldapmon directory server monitoring agent.
//!
//! This library supports the ldapmon binary found elsewhere in this project.
//! It reads the operational-statistics entries a directory server exposes
//! under `cn=monitor`, matches their attributes against operator supplied
//! metric specifications and hands the resulting counters, rates and gauges to
//! a reporting [`sink::Sink`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod agent;
pub mod config;
pub mod directory;
pub mod engine;
pub mod metric_spec;
pub mod probe;
pub mod rate;
pub mod sink;
