pub mod engine;
pub mod extra;
pub mod globals;
pub mod host_info;
pub mod include_globals;
pub mod native_globals;
pub mod udr_globals;

pub use engine::{EngineConfig, EvalEngine};
pub use extra::ContextExtra;
