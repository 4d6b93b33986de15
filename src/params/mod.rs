//! Parameter-space handling: the composable source tree, concrete leaves
//! and the job-number adapter that keeps external job identity stable
//! across resyncs.

pub mod adapter;
pub mod point;
pub mod source;

pub use adapter::ParameterAdapter;
pub use point::{ParameterMetadata, ParameterPoint};
pub use source::{CounterSource, LeafSource, ParameterSource, ResyncResult, VarSource};
