//! Typed wrappers around the service's JSON endpoints. Each submodule
//! covers one endpoint family; all of them go through [`crate::client`]
//! and surface failures via the response classifier.

pub mod download;
pub mod fs;
pub mod upload;
