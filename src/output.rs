//! Artifact output shared by both binaries: the `--output <path>` branches
//! and the stdout fallbacks.

use std::io::Write;
use std::path::Path;

use crate::Result;
use crate::har::{Har, StreamSink, to_pretty_json};

/// Writes a finished HAR document to `path` as indented JSON.
pub fn write_har(har: &Har, path: &Path) -> Result<()> {
    let json = to_pretty_json(har)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Writes raw artifact bytes (HTML, text, PNG, cookie JSON) to `path`.
pub fn write_artifact(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Emits artifact bytes to stdout with a trailing newline for text output.
pub fn print_artifact(bytes: &[u8]) -> Result<()> {
    let mut stdout = std::io::stdout();
    stdout.write_all(bytes)?;
    if !bytes.ends_with(b"\n") {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

/// Opens the streaming sink: the file at `path` when given, stdout otherwise.
pub fn stream_sink(path: Option<&Path>) -> Result<StreamSink> {
    match path {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Ok(StreamSink::new(Box::new(file)))
        }
        None => Ok(StreamSink::new(Box::new(std::io::stdout()))),
    }
}
