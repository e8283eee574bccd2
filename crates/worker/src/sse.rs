//! Server-Sent Events decoding
//!
//! Turns a chunked HTTP body into the `data` payloads of its events. Only
//! the `data` field is used; comments and other fields are skipped.

use bytes::Bytes;
use chatrelay_common::{ChatRelayError, Result};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

/// Longest accepted line in the event stream
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Stream of event payloads
pub type EventStream = BoxStream<'static, Result<String>>;

/// Decode an SSE body into event payloads
pub fn data_events<S, E>(body: S) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let reader = StreamReader::new(body.map_err(std::io::Error::other));
    let lines = Box::pin(FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
    ));

    stream::unfold(Some(lines), |state| async move {
        let Some(mut lines) = state else {
            return None;
        };
        let mut data: Vec<String> = Vec::new();

        loop {
            match lines.next().await {
                Some(Ok(line)) => {
                    if line.is_empty() {
                        if !data.is_empty() {
                            return Some((Ok(data.join("\n")), Some(lines)));
                        }
                        continue;
                    }
                    if let Some(value) = field_value(&line, "data") {
                        data.push(value.to_string());
                    }
                }
                Some(Err(e)) => return Some((Err(ChatRelayError::from(e)), None)),
                None => {
                    if data.is_empty() {
                        return None;
                    }
                    return Some((Ok(data.join("\n")), None));
                }
            }
        }
    })
    .boxed()
}

/// Value of `field` on this line; a bare field name has an empty value
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    if rest.is_empty() {
        return Some("");
    }
    let value = rest.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}
