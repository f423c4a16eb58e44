//! Protocol logic for the wasm task solver: the bisection game played against a challenger,
//! the per-phase judge proofs, and the commit-reveal primitives. Nothing in this crate
//! performs I/O; the driver feeds it ledger events and execution traces.

pub mod verification;
