//! `oai-harvest example` command implementation

use crate::config::EXAMPLE_CONFIG;

/// Print an annotated configuration file
pub fn run() {
    print!("{}", EXAMPLE_CONFIG);
}
