//! Canal de contrôle : flux de confirmation des opérations, grammaire de
//! sélection et de commande, relais des notifications.

pub mod commands;
pub mod error;
pub mod flows;
pub mod notifier;
pub mod response;
pub mod selection;
pub mod service;

pub use commands::Command;
pub use error::{ControlError, ControlResult};
pub use notifier::{NotificationSink, run_notifier};
pub use response::{Reply, Response};
pub use service::ControlService;
