pub mod entities;
pub mod error;
pub mod event;
pub mod memory;
pub mod traits;

pub use entities::{
    DeployedVm, HotSpare, IpMethod, NetworkDefinition, NetworkType, PlatformNetworkMapping,
    SpareStatus, VmInterfaceRow, VmStatus,
};
pub use error::{Result, StoreError};
pub use event::Event;
pub use memory::InMemoryStore;
pub use traits::{DataStore, DeployedVmStore, HotSpareStore, NetworkStore, VmInterfaceStore};
