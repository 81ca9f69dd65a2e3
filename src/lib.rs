pub mod args;
pub mod bert;
pub mod checkpoint;
pub mod context;
pub mod data;
pub mod error;
pub mod run;
pub mod train;

#[cfg(test)]
mod testing;
