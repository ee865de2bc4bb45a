pub mod error;
pub mod profile;
pub mod topology;
pub mod matcher;
pub mod transaction;
pub mod executor;
pub mod state;
pub mod ipc;

pub use error::{OutlayError, Result, ErrorReporting, ControlError};
pub use profile::{ModeRequest, OutputSelector, Position, Profile, ProfileOutputRule, Transform};
pub use topology::{Head, HeadField, HeadId, Mode, ModeField, ModeId, Snapshot, Topology};
pub use matcher::{find_match, Match};
pub use transaction::{EnabledHead, HeadConfig, ModeSelection, Outcome, OutputBackend, Transaction};
pub use executor::{CommandRunner, ProcessExecutor};
pub use state::{DaemonState, DeferredRequest, ReconfigureStatus, Reply, Target};
pub use ipc::{ControlRequest, HeadStatus, IpcClient, IpcCommand, IpcResponse, IpcServer, StatusReport};
