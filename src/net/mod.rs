//! Socket plumbing.
mod socket;

pub use socket::{RawStream, RemoteAddr, Stream};
