mod backend;
mod connection;

pub use backend::*;
pub use connection::*;
