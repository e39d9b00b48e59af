pub mod cidr;
pub mod pool;

pub use cidr::Cidr;
pub use pool::{AddressAllocator, AddressPool, AllocError, PersistedPool, PoolUsage};
