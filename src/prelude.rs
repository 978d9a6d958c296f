//! A module exporting useful traits defined in this crate.

pub use crate::clock::{Clock, Reference};
pub use crate::drivers::Driver;
#[cfg(feature = "shared_store")]
pub use crate::drivers::Store;
