//! # Multimap CLI Entry Point
//!
//! ```bash
//! multimap stats    ./map
//! multimap import   ./map ./pairs.b64 --create
//! multimap export   ./map ./pairs.b64
//! multimap optimize ./map ./rewritten --bs 128
//! ```

use std::env;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(e) = multimap::cli::run(&args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
