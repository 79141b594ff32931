pub mod generation;
pub mod training;

pub use generation::*;
pub use training::*;
