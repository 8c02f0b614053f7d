pub mod batcher;
pub mod coordinator;
pub mod request;
pub mod stats;
pub mod worker;

pub use batcher::*;
pub use coordinator::*;
pub use request::*;
pub use stats::*;
pub use worker::*;
