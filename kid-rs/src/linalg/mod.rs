//! Linear algebra and nonlinear least squares.

mod circle;
mod lm;
mod pca;

pub use circle::*;
pub use lm::*;
pub use pca::*;
