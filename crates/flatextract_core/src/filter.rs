// filter.rs: pass a field value through an external command
use log::debug;
use std::io::{Seek, SeekFrom, Write};
use std::process::{Command, Stdio};

use crate::error::{FfeError, Result};

/// Run `command` under `sh -c` with `input` on its stdin and return its stdout.
///
/// The input is spooled to an anonymous temp file that becomes the child's stdin.
/// One trailing newline of the output is dropped.
pub fn run_filter(command: &str, input: &[u8]) -> Result<Vec<u8>> {
    let process_err = |reason: String| FfeError::Process { command: command.to_string(), reason };

    let mut spool = tempfile::tempfile()?;
    spool.write_all(input)?;
    spool.seek(SeekFrom::Start(0))?;

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::from(spool))
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| process_err(e.to_string()))?;
    if !output.status.success() {
        return Err(process_err(format!("exited with {}", output.status)));
    }
    let mut out = output.stdout;
    if out.last() == Some(&b'\n') {
        out.pop();
    }
    debug!("Filter '{}' turned {} bytes into {}", command, input.len(), out.len());
    Ok(out)
}
