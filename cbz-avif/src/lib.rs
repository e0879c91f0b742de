#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub use crate::{
    convert::{default_output_path, Config, Convert, LogLevel},
    errors::{Error, Result},
    transform::{default_max_parallel, BulkTransform, Event},
};

pub mod convert;
pub mod errors;
pub mod transform;
