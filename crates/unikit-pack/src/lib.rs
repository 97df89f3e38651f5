//! Package manager contract and pull staging.
//!
//! The concrete registry providers (OCI, HTTP tarballs, Git) live outside
//! this repository; unikit consumes them through the [`manager`] traits.
//! What does live here is the catalog lookup policy (local first, then a
//! remote-update retry) and the helpers that stage pulled artifacts on
//! disk: digest verification and archive unpacking.

pub mod archive;
pub mod digest;
pub mod manager;

pub use manager::{NullPackageManager, Package, PackageManager, PullOptions, Query, find_packages};
