pub mod file;
pub mod memory;

pub use file::JsonFilePolicyStore;
pub use memory::InMemoryPolicyStore;
