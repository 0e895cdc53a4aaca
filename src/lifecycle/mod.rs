//! Connection lifecycle primitives
//!
//! - [`shutdown`]: the running → draining → terminated phase machine every
//!   long-running task observes
//! - [`signals`]: maps SIGINT/SIGTERM onto shutdown phases
//! - [`admission`]: the counting gate bounding concurrent connections

pub mod admission;
pub mod shutdown;
pub mod signals;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use shutdown::{Phase, Shutdown, ShutdownSignal};
pub use signals::spawn_signal_listener;
