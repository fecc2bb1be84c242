//! Session and data reset engine
//!
//! [`Engine`] is the entry point; the other modules are its components:
//! - [`paths`]: application name to data roots
//! - [`process`]: detecting and stopping running instances
//! - [`store`]: backup archives and the session index
//! - [`identity`]: device identifier regeneration

pub mod archive;
pub mod error;
pub mod identity;
pub mod index;
pub mod lock;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod slug;
pub mod status;
pub mod store;

pub use archive::TreeFilter;
pub use error::{EngineError, Result};
pub use identity::IdentityUpdate;
pub use index::{ArchiveFormat, BackupRecord, BackupStatus, SessionIndex};
pub use orchestrator::{
    CancelToken, Engine, OperationKind, OperationResult, OperationState, ProgressObserver,
    ResetOptions,
};
pub use paths::PathResolver;
pub use process::{ProcessController, ProcessInfo, ProcessTable, SystemProcessTable, TerminationResult};
pub use status::AppStatus;
pub use store::BackupStore;
