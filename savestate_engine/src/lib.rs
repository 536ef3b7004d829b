pub mod codec;
pub mod config;
pub mod discovery;
pub mod host;
pub mod main_loop;
pub mod net;
pub mod osc;
pub mod query_server;
pub mod session;
pub mod store;
pub mod tree;

pub use config::EngineConfig;
pub use host::EngineHost;
pub use main_loop::{Collaborators, EngineError, EventReceiver, MainLoop, Status};
pub use session::{SessionEvent, SessionState};
pub use store::{ProfileEntry, ProfileStore, StoreError};
