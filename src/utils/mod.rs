mod logging;
mod wait;

pub use logging::*;
pub use wait::*;
