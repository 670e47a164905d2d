//! Integration test suite for keel.
//!
//! These tests drive whole passes and hook runs against a temporary state
//! directory and verify that the components work together.
//!
//! # Test Categories
//!
//! - `pass_flow`: Orchestration passes over queue and signal files
//! - `replenishment`: Dynamic buffer and quality gates end to end
//! - `hook_runner`: Budgets, timeout penalties and parallel batches
//! - `circuit_recovery`: Breaker graduation through passes and probes
//! - `state_store`: Atomic writes and cache invalidation
//!
//! Hook fixtures are `#!/bin/sh` scripts, so the hook and circuit suites
//! are unix only.


mod pass_flow;
mod replenishment;
mod state_store;

#[cfg(unix)]
mod hook_runner;
