// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

fn run() -> Result<()> {
    chariot_utils::initialize_tracing();
    tracing::trace!("starting");
    chariot_lib::cli::run(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
