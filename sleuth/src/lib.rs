//! Bounded, automated root-cause investigation.
//!
//! An investigation alternates between a reasoning service that proposes
//! hypotheses and picks diagnostic probes, and a catalog of probes that
//! observe the system under investigation. The crate is split the same way
//! throughout:
//!
//! - **[`core`]**: Pure session model, signatures, invariants. No I/O.
//! - **[`io`]**: Side effects (files, processes, worker threads, the agent backend).
//! - **[`registry`]**, **[`resolver`]**, **[`reasoning`]**: the probe catalog, its
//!   dependency resolution, and the boundary to the reasoning service.
//!
//! [`investigation`] ties them together into the step loop that drives a
//! session to `concluded`, `exhausted`, `aborted` or `errored`.

pub mod cancel;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod investigation;
pub mod io;
pub mod logging;
pub mod probes;
pub mod reasoning;
pub mod registry;
pub mod resolver;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
