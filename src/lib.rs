#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod bleu;
pub mod checkpoint;
pub mod config;
pub mod cornell;
pub mod crossent;
pub mod data;
pub mod eval;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod scst;
pub mod vocab;

#[cfg(test)]
mod scripted;
