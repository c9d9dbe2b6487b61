pub mod ess;

pub use ess::*;
