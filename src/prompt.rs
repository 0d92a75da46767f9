//! This module implements prompting.

use std::io::BufRead;
use std::io::Write;
use std::{fmt, io};

// TODO Add line edition
/// Show a prompt. This function returns when a newline is received.
///
/// Returns None at end of input.
pub fn prompt<P: fmt::Display>(prompt: P) -> Option<String> {
    // Show prompt
    print!("{prompt}");
    let _ = io::stdout().flush();
    // Read input
    let input = io::stdin().lock().lines().next()?.unwrap_or(String::new());
    Some(input)
}
