//! The remote connection layer (spec.md §4.4 C4, §4.1 C5): dials, handshakes with, and
//! supervises one shell agent per remote, and the registry that owns all of them.

pub mod cmd;
pub mod error;
pub mod install;
pub mod proc;
pub mod pty_io;
pub mod registry;
pub mod remote;
pub mod sink;
pub mod state;
pub mod status;

pub use cmd::{EphemeralOpts, RunCmd};
pub use error::ProcError;
pub use proc::{LaunchOpts, WaveshellProc};
pub use registry::RemoteRegistry;
pub use remote::{ConnectMode, Remote, ShellPref, TransportConfig};
pub use sink::{CommandPacketSink, DataAckOutcome};
pub use state::{versions_compatible, InitInfo, ShellStateMap, CORE_PROTOCOL_VERSION};
pub use status::{InstallStatus, Status};
