//! Line-oriented handling of child process output.
//!
//! Each child's stdout and stderr are read by their own task, split on `\n`,
//! and every complete line is passed to a `LineHandler`. The default handler
//! echoes the line to our stdout as `"<name> | <line>"`.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Callback invoked once per line of child output.
pub type LineHandler = Arc<dyn Fn(StreamKind, &str) + Send + Sync>;

/// Formats a line the way it is echoed to the supervisor's stdout.
pub fn format_line(name: &str, line: &str) -> String {
    format!("{} | {}", name, line)
}

/// Handler that prints each line prefixed by `name`.
pub fn prefixed(name: &str) -> LineHandler {
    let name = name.to_string();
    Arc::new(move |_stream, line| println!("{}", format_line(&name, line)))
}

/// Reads `reader` to EOF, invoking `handler` for every line.
///
/// Line terminators (`\n` or `\r\n`) are stripped and invalid UTF-8 is replaced.
/// A final line without a terminator is still delivered.
pub async fn read_lines<R>(reader: R, stream: StreamKind, handler: LineHandler)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                handler(stream, &String::from_utf8_lossy(&buf));
            }
        }
    }
}
