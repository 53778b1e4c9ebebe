pub mod admission;

#[macro_use]
extern crate tracing;
