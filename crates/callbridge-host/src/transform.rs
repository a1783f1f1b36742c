//! Built-in string transforms served by the host process.

use callbridge_core::{CallbackSet, Payload, StatusCode, PASS_AND_GET_STRING};
use clap::ValueEnum;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transform {
    /// Return the input unchanged
    Echo,
    /// Uppercase the input
    Upper,
    /// Reverse the input by character
    Reverse,
    /// Return an empty result
    Empty,
}

impl Transform {
    pub fn apply(self, input: &str) -> Option<String> {
        match self {
            Transform::Echo => Some(input.to_string()),
            Transform::Upper => Some(input.to_uppercase()),
            Transform::Reverse => Some(input.chars().rev().collect()),
            Transform::Empty => None,
        }
    }

    /// Callback set exposing this transform as `pass_and_get_string`.
    pub fn callbacks(self) -> CallbackSet {
        CallbackSet::new().with(PASS_AND_GET_STRING, move |input: &[u8]| {
            let input = std::str::from_utf8(input).map_err(|_| StatusCode::NO_UNICODE_TRANSLATION)?;
            debug!("{:?} <- {:?}", self, input);
            Ok(self.apply(input).map(Payload::from))
        })
    }
}
