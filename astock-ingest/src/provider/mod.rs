//! Upstream data providers.

pub mod aktools;

pub use aktools::{AkToolsClient, AkToolsIdentifiers, AkToolsSource, ParamValue, RequestSpec};
