//! Host memory backing.
//!
//! [`HostRegion`] is the one owner of raw host memory in the crate. System
//! surfaces draw from the heap flavor; the simulated runtime maps pages for
//! everything it pretends lives on a device.

mod region;

pub use region::HostRegion;
