pub mod system;
pub mod traits;

pub use system::{available_ports, SystemSerial};
pub use traits::{SerialBackend, SerialPort};
