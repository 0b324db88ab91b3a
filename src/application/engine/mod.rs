pub mod callbacks;
pub mod live_engine;

pub use callbacks::{EngineCallbacks, NoopCallbacks};
pub use live_engine::LiveEngine;
