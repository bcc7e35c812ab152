mod dap;
mod gzdap;

pub use crate::dap::*;
pub use crate::gzdap::*;
