#![doc = include_str!("../README.md")]
#![deny(unsafe_code, missing_docs)]

pub mod cache;
pub mod collector;
pub mod connection;
pub mod conntrack;
pub mod context;
pub mod datapath;
pub mod error;
pub mod packet;
pub mod policy;
pub mod service;
pub mod tokens;
