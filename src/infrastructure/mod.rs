pub mod bluetooth;
pub mod emit;
pub mod logging;
