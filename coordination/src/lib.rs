//! Autonomous software-delivery pipeline orchestration core.
//!
//! A card (unit of work) is planned into an ordered stage list, routed through
//! an optional keyword/AI filter, and driven stage-by-stage by the execution
//! strategy under supervisor-managed retry and circuit-breaking. Outcomes feed
//! the learning engine and knowledge store so later cards benefit from past
//! runs; every pipeline run is observable and resumable from persisted state.
//!
//! See `artemis` for the module map; `crates/artemis-cli` is the reference
//! binary that wires this library's traits to concrete backends.

#![allow(dead_code)]
#![allow(clippy::uninlined_format_args)]

pub mod artemis;
