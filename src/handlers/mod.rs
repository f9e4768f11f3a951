//! HTTP request handlers for the job API.

pub mod jobs;

pub use jobs::*;
