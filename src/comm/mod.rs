//! Process-group communication: the communicator trait, its backends, and
//! the deterministic blocking collectives built on top.

pub mod collective;
pub mod communicator;
pub mod wire;

pub use communicator::{Communicator, NoComm, ThreadComm, Wait};

#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
