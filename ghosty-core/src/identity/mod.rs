//! Interface identity: hardware address changes and restoration

pub mod address;
pub mod manager;
pub mod store;

pub use address::{parse_new_address, MacAddress};
pub use manager::{IdentityResult, InterfaceIdentityManager};
pub use store::IdentityStore;
