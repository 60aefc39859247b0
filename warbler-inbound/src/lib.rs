pub mod module;
pub mod sasl;
pub mod session;
pub mod transport;
