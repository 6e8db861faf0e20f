pub mod nodeid;
pub mod packet;

pub use nodeid::*;
pub use packet::*;
