#![deny(warnings)]
#![deny(clippy::all)]
#![cfg_attr(test, allow(dead_code, non_snake_case))]
pub mod config;
pub mod dn;
pub mod dto;
pub mod kratos;
pub mod proto;
pub mod server;
#[cfg(test)]
mod test_util;
