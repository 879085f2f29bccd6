//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for synod.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SynodError(pub String);

impl fmt::Display for SynodError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for SynodError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `SynodError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for SynodError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SynodError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(num::ParseIntError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = SynodError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = SynodError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
