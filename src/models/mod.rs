pub mod attempt;
pub mod proxy;

pub use attempt::*;
pub use proxy::*;
