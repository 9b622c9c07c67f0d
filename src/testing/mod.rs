//! Testing utilities for CrabView
//!
//! In-memory registry, relay and negotiator doubles that record every
//! resource they hand out, so tests can assert nothing outlives a session.

pub mod mocks;

pub use mocks::{
    LifecycleCounters, MockConnector, MockNegotiatorFactory, MockRegistry, MockStack,
};
