#![doc = include_str!("../README.md")]

mod call;
mod client;
mod connection;
mod context;
mod error;
mod object;
mod pack;
mod server;
mod shmem;
mod transport;

pub mod bus;
pub mod query;
pub mod serializer;

pub use call::*;
pub use client::*;
pub use connection::*;
pub use context::*;
pub use error::*;
pub use object::*;
pub use pack::*;
pub use server::*;
pub use shmem::*;
pub use transport::*;

pub use bus::BusNode;
pub use query::{QueryIter, QueryParams};
pub use serializer::Serializer;
