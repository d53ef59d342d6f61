//! Local identity persistence.
//!
//! The current display name is stored under a single key in a
//! [`KeyValueStore`] scoped to the device. [`IdentityStore`] is the only
//! component that reads or writes it.

mod preferences;
mod store;

pub use preferences::{FilePreferences, KeyValueStore, MemoryPreferences};
pub use store::{IdentityStore, USERNAME_KEY};
