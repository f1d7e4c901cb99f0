//! Local game-server manager core.
//!
//! [`ServerManager`] owns the running server processes, [`JavaRuntime`]
//! provisions the Java runtime they need, and [`JsonProfileStore`] persists
//! server profiles. Log lines and provisioning progress are published on
//! [`EventBus`]es.

pub mod archive;
pub mod config;
pub mod error;
pub mod events;
pub mod java_runtime;
pub mod log_mux;
pub mod minecraft_launch;
pub mod mods;
pub mod process_manager;
pub mod registry_store;

pub use config::AgentConfig;
pub use error::{ManagerError, Result};
pub use events::{EventBus, Subscription};
pub use java_runtime::{JavaRuntime, JavaVersionProbe, RuntimeProbe};
pub use mods::{FolderImportOptions, ImportResult, ModInfo, ModManager};
pub use process_manager::ServerManager;
pub use registry_store::{JsonProfileStore, NewProfile, ProfileStore};
