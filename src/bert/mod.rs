mod embedding;
mod core;
mod head;
mod pretraining;

pub use embedding::*;
pub use core::*;
pub use head::*;
pub use pretraining::*;
