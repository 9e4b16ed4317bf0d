pub mod engine;
pub mod message;
pub mod peers;
pub mod queue;

pub use engine::*;
pub use message::*;
pub use peers::*;
pub use queue::*;
