//! Session engine of an MQTT 3.1.1 client: opens the transport, performs the CONNECT handshake
//!  and drives a live session with its inbound / outbound pumps and protocol dispatcher.

pub mod config;
pub mod packet;
pub mod session;
pub mod test_util;
pub mod transport;
pub mod util;

pub use config::SessionConfig;
pub use session::{connect, start, ConnectionLostHandler, ConnectionRefused, SessionHandle};
