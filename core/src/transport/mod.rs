// Transport module: the byte link between this library and the radio

pub mod abstraction;
pub mod memory;

pub use abstraction::{
    ConnectionState, DataCallback, EventCallback, TransportError, TransportEvent, TransportPort,
};
pub use memory::MemoryTransport;
