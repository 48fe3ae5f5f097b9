//! Library wrapper around the `strata` CLI.
//!
//! Compiling the binary crate root as a module lets `cargo test -p strata-cli --lib` typecheck
//! the CLI without building the binary test suite.

#[allow(dead_code)]
#[path = "main.rs"]
mod main_bin;
