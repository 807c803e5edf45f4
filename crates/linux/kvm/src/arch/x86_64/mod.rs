mod boot_params;
mod devices;
mod memory;
mod mptable;
mod vcpu;

pub use boot_params::*;
pub use devices::*;
pub use memory::*;
pub use mptable::*;
pub use vcpu::*;
