pub mod buffer;
pub mod name;
pub mod packet;
pub mod set;
