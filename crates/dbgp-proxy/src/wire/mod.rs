pub mod command;
pub mod framing;
pub mod xml;
