//! Helpers shared by the USB host crates: volatile register access and bounded waits.

pub mod io;
pub mod timeout;
