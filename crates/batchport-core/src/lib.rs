pub mod backend;
pub mod error;
pub mod rows;
pub mod session;
pub mod spec;

pub use backend::*;
pub use error::*;
pub use rows::*;
pub use session::*;
pub use spec::*;
