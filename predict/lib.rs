#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod aggregate;
pub mod artifacts;
pub mod base;
pub mod data;
pub mod encoder;
pub mod meta;
pub mod model;
pub mod normalizer;
pub mod output;
pub mod pipeline;
pub mod types;
