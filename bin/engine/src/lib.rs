pub mod collaborators;
pub mod config;
pub mod db;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod events;
pub mod manifest;
pub mod naming;
pub mod reconcile;
pub mod remote;
pub mod stream;

pub use config::{engine_config, EngineConfig};
pub use engine::{Engine, Operation};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use events::{Event, EventHandle, EventStream};
pub use stream::{WireEvent, WireEventKind};
