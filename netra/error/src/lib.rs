#![deny(warnings, rust_2018_idioms)]

/// A boxed type that implements all the error traits we care about, so that
/// heterogeneous failures can be propagated through the proxy without a
/// mega-enum at every seam.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;
