#![forbid(unsafe_code)]

pub mod assistant;
pub mod authz;
pub mod connection;
pub mod hub;
pub mod rooms;
pub mod router;
pub mod signaling;



#[cfg(test)]
mod rooms_tests;

#[cfg(test)]
mod router_tests;
