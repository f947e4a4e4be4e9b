//! Child process execution with streamed output

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use keel_core::domain::log::LogStream;

use super::CommandOutput;
use crate::sink::OutputSink;

/// Spawns `command` and forwards stdout/stderr lines to `sink` as they arrive
///
/// The child is killed if the returned future is dropped before completion,
/// which is how timeouts terminate work in flight.
pub async fn run_streaming(
    mut command: Command,
    sink: &dyn OutputSink,
) -> std::io::Result<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

    let (stdout, stderr) = tokio::join!(
        read_lines(stdout, LogStream::Stdout, sink),
        read_lines(stderr, LogStream::Stderr, sink),
    );
    let status = child.wait().await?;

    let exit_code = status.code().unwrap_or(-1);
    debug!("Process exited with code {}", exit_code);

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

/// Reads `reader` line by line until EOF
///
/// Bytes that are not valid UTF-8 are replaced rather than rejected. A read
/// error ends the stream but keeps what was captured so far.
async fn read_lines<R>(reader: R, stream: LogStream, sink: &dyn OutputSink) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut captured = String::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text: &str = &text;
                let line = text.strip_suffix('\n').unwrap_or(text);
                let line = line.strip_suffix('\r').unwrap_or(line);
                sink.line(stream, line);
                captured.push_str(line);
                captured.push('\n');
            }
            Err(e) => {
                warn!("Stopped reading {:?} output: {}", stream, e);
                break;
            }
        }
    }
    captured
}
