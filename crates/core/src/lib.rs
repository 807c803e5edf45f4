pub mod capabilities;
pub mod config;
pub mod console;
pub mod driver;
pub mod error;
pub mod exit;

pub use capabilities::Capabilities;
pub use config::{MIN_MEMORY_MB, NetworkConfig, NetworkMode, SharedDir, VmConfig};
pub use console::{
    Console, ConsoleReader, ConsoleWriter, GuestConsole, HostConsole, console_pipes,
    set_nonblocking,
};
pub use driver::{Driver, DriverInfo, DriverState};
pub use error::{Error, Result};
pub use exit::{ExitNotifier, ExitSignal, ExitStatus, exit_channel};
