mod event;
mod outcome;
mod rule;

pub use event::*;
pub use outcome::*;
pub use rule::*;
