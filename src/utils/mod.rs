pub mod filesystem;
pub mod net;
pub mod process;
