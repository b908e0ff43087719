//! Parc d'hôtes : registre persistant, capacités d'exécution par type,
//! orchestration de l'arrêt d'urgence et surveillance de joignabilité.

pub mod monitor;
pub mod orchestrator;
pub mod plugins;
pub mod store;
pub mod types;

pub use monitor::Monitor;
pub use orchestrator::{Orchestrator, PhaseReport, ShutdownOutcome, ShutdownProgress, ShutdownReport};
pub use plugins::{ApiPlugin, ConnectionTest, Executors, PluginRegistry, ShellTransport, ShutdownResult, ShutdownStatus};
pub use store::HostRegistry;
pub use types::*;
