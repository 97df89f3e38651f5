//! Networks, volumes, and port forwarding for unikit machines.
//!
//! Each resource follows the spec/status split: the spec is what the user
//! asked for, the status what the driver observed. Services persist through
//! the embedded object store and expose the parsing helpers the run
//! pipeline uses to turn CLI strings into typed resources.

pub mod network;
pub mod port;
pub mod volume;
