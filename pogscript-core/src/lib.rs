pub mod config;
pub mod executable;
pub mod installer;
pub mod protocol;
pub mod run;

pub use run::{OwnerId, RunEventSender, RunManager, RunMessage, StartOutcome, StopOutcome};
