//! Signal-processing kernels: spectral density estimation, spectral and
//! timestream binning, and peak geometry.

pub mod binning;
pub mod peak;
pub mod spectral;
pub mod traits;
