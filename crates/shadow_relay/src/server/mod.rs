#![forbid(unsafe_code)]

pub mod connection;
pub mod gate;
pub mod health;
pub mod listener;
pub mod policy;
pub mod registry;
pub mod router;
pub mod state;



#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod router_tests;

#[cfg(test)]
mod connection_tests;
