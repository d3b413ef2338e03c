//! Generic worker binary. It can run the built-in mailbox node; programs with
//! their own entries ship a binary like this one that registers them too.

use std::process::ExitCode;
use tlaunch::entry::process::worker_main;
use tlaunch::{transmit, EntryRegistry};

fn main() -> ExitCode {
    let mut registry = EntryRegistry::new();
    transmit::node::register(&mut registry);
    worker_main(registry)
}
