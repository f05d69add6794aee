//! Lib for callisto
//!
//! Most of the process wiring lives in `main.rs`. This file builds the
//! crate as a library for integration tests and holds the one general
//! utility function that doesn't have a more specific home.
pub mod audit;
pub mod character;
pub mod compendium;
pub mod config;
pub mod entity;
pub mod error;
pub mod identity;
pub mod payloads;
pub mod permission;
pub mod persistence;
pub mod player;
pub mod rest;
pub mod server;
pub mod transport;

#[macro_use]
mod cov_util;

use std::fs::File;
use std::io::{BufReader, Read};

/// Read a file from the local filesystem. Used at startup for compendium
/// category files and any other static JSON assets.
///
/// # Errors
///
/// Will return `Err` if the file cannot be opened or read.
pub fn read_local_file(filename: &str) -> Result<Vec<u8>, std::io::Error> {
  let file = File::open(filename)?;
  let mut buf_reader = BufReader::new(file);
  let mut content: Vec<u8> = Vec::with_capacity(1024);
  buf_reader.read_to_end(&mut content)?;
  Ok(content)
}
