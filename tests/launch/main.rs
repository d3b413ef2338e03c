#[path = "../support/mod.rs"]
mod support;

mod kubernetes;
mod local;
mod ssh;
mod transmit;
