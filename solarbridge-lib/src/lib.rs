pub mod device;
pub mod port;
pub mod protocol;
pub mod regs;
pub mod server;
