//! Domain layer: data types, settings and the position math.

pub mod filter;
pub mod mailbox;
pub mod models;
pub mod settings;
pub mod trilateration;
