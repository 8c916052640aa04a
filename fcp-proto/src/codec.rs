//! Line-oriented message codec over any async buffered stream.
//!
//! Each message is: `Name\n`, `Key=Value\n`…, then `EndMessage\n`, or
//! `Data\n` followed by exactly `DataLength` payload bytes.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::field;
use crate::message::Message;

/// Maximum allowed line length (64 KiB).
const MAX_LINE: u64 = 64 * 1024;

/// Maximum allowed `DataLength` of an inbound payload (16 MiB).
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Terminator of a message without payload.
const END_MESSAGE: &str = "EndMessage";

/// Terminator of a message followed by `DataLength` payload bytes.
const DATA: &str = "Data";

/// Writes `msg` to `w` and flushes.
pub async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    msg: &Message,
) -> io::Result<()> {
    check_token(msg.name())?;
    let mut buf = String::with_capacity(64);
    buf.push_str(msg.name());
    buf.push('\n');
    for (key, value) in msg.fields() {
        check_token(key)?;
        check_token(value)?;
        if key.contains('=') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("field name {key:?} contains '='"),
            ));
        }
        buf.push_str(key);
        buf.push('=');
        buf.push_str(value);
        buf.push('\n');
    }
    buf.push_str(if msg.payload().is_some() { DATA } else { END_MESSAGE });
    buf.push('\n');

    w.write_all(buf.as_bytes()).await?;
    if let Some(payload) = msg.payload() {
        w.write_all(payload).await?;
    }
    w.flush().await
}

/// Reads the next message from `r`.
///
/// Returns `Ok(None)` when the stream ends cleanly between messages.
pub async fn read_message<R: AsyncBufRead + Unpin + ?Sized>(
    r: &mut R,
) -> io::Result<Option<Message>> {
    let name = loop {
        match read_line(r).await? {
            None => return Ok(None),
            Some(line) if line.is_empty() => {}
            Some(line) => break line,
        }
    };

    let mut msg = Message::new(name);
    loop {
        let line = read_line(r)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "message truncated"))?;
        match line.as_str() {
            END_MESSAGE => return Ok(Some(msg)),
            DATA => {
                let len = msg
                    .field(field::DATA_LENGTH)
                    .and_then(|v| v.parse::<usize>().ok())
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "Data without valid DataLength")
                    })?;
                if len > MAX_PAYLOAD {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "payload exceeds 16 MiB limit",
                    ));
                }
                let mut payload = vec![0u8; len];
                r.read_exact(&mut payload).await?;
                return Ok(Some(msg.with_payload(payload)));
            }
            _ => {
                let (key, value) = line.split_once('=').ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed field line {line:?}"),
                    )
                })?;
                msg = msg.with_field(key, value);
            }
        }
    }
}

/// Reads one line without its terminator; `None` at end of stream.
async fn read_line<R: AsyncBufRead + Unpin + ?Sized>(r: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    let n = (&mut *r).take(MAX_LINE).read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        if n as u64 >= MAX_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line exceeds 64 KiB limit",
            ));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended mid-line",
        ));
    }
    line.pop();
    if line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Rejects strings that would break line framing.
///
/// `\r` is refused too: the reader strips it before `\n`.
fn check_token(s: &str) -> io::Result<()> {
    if s.contains(['\n', '\r']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{s:?} contains a line break"),
        ));
    }
    Ok(())
}
