mod interp;
mod lstsq;
mod poly;
mod unwrap;

pub use interp::*;
pub use lstsq::*;
pub use poly::*;
pub use unwrap::*;
