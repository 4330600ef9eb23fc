#![doc = include_str!("../README.md")]

mod error;

pub mod downlink;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod stager;
pub mod storage;
pub mod telemetry;
pub mod transform;

pub use error::{Error, Result};
