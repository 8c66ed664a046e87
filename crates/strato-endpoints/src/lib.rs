//! Per-model endpoint resolution and in-flight accounting
//!
//! The [`Resolver`] keeps a live address set per model, fed by an
//! EndpointSlice watch. Proxy handlers wait on it for a ready replica
//! (suspending while a model scales from zero) and get back the
//! least-loaded address together with a guard that releases the
//! per-replica count. The [`InFlightIndex`] tracks per-model totals,
//! which the autoscaler scrapes across control-plane replicas.

mod group;
mod inflight;
mod resolver;

pub use group::{EndpointGroup, EndpointRef, ResolveError};
pub use inflight::InFlightIndex;
pub use resolver::Resolver;
