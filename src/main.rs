//! Binary entrypoint for the journal sync command-line client.

use std::process::ExitCode;

use journal_sync::start_journal_sync;

/// Parse the command line and run the requested command.
fn main() -> ExitCode {
    start_journal_sync::run()
}
