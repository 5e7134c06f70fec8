//! Service records, runtime options and the record store consumed by the
//! mcp-relay runtime.

pub mod options;
pub mod record;
pub mod store;

pub use options::{OptionsFile, RuntimeOptions};
pub use record::{ServiceRecord, ServiceType};
pub use store::{MemoryServiceStore, RelayConfig, ServiceEntry, ServiceStore, TomlServiceStore};
