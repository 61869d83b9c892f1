pub mod classifier;
pub mod trampoline;
pub mod writer;
