//! Long-poll fallback transport: `POST /api/send` for outbound frames,
//! a chunked `GET /api/stream` NDJSON response for inbound.
//!
//! Outbound frames are batched briefly so a burst of tunnel chunks rides
//! one POST; a failed POST puts the whole batch back on the outbox and
//! retries after a fixed backoff. The stream reader reopens forever on
//! any error. Neither direction ever gives up — this transport has no
//! terminal failure, which is exactly why `auto` can land on it.

use std::time::Duration;

use futures::StreamExt;
use rwp_protocol::{Frame, PROTOCOL_VERSION, Role};
use tracing::{debug, warn};

use crate::options::ClientOptions;
use crate::transport::{EventSink, Outbox};

/// How long the sender waits for more frames to join a batch.
const BATCH_WINDOW: Duration = Duration::from_millis(15);
const BATCH_MAX_BYTES: usize = 32 * 1024;
const BATCH_MAX_FRAMES: usize = 64;

/// Backoff after a failed POST or a dropped stream.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Runs the fallback transport until the outbox closes.
pub(crate) async fn run(role: Role, options: &ClientOptions, outbox: &mut Outbox, events: &EventSink) {
    let client = build_client(options);
    let base = options.http_base();
    let session = urlencoding::encode(&options.session).into_owned();
    let send_url = format!("{base}api/send/{session}?role={role}");
    let stream_url = format!("{base}api/stream/{session}?role={role}");

    // Registration: `hello` is the first frame posted, retried until the
    // relay takes it.
    let hello = Frame::Hello {
        role,
        session: options.session.clone(),
        protocol_version: Some(PROTOCOL_VERSION),
    };
    loop {
        match post_frames(&client, &send_url, role, std::slice::from_ref(&hello)).await {
            Ok(()) => break,
            Err(err) => {
                debug!(%err, "hello post failed; retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
    events.connected();

    let reader = tokio::spawn(read_stream(client.clone(), stream_url, events.clone()));

    // Sender loop with batching.
    loop {
        let Some(first) = outbox.next().await else { break };
        let mut size = frame_size(&first);
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + BATCH_WINDOW;
        while batch.len() < BATCH_MAX_FRAMES && size < BATCH_MAX_BYTES {
            match tokio::time::timeout_at(deadline, outbox.next()).await {
                Ok(Some(frame)) => {
                    size += frame_size(&frame);
                    batch.push(frame);
                }
                Ok(None) | Err(_) => break,
            }
        }

        if let Err(err) = post_frames(&client, &send_url, role, &batch).await {
            debug!(%err, frames = batch.len(), "send failed; batch requeued");
            outbox.push_front_batch(batch);
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    reader.abort();
}

fn build_client(options: &ClientOptions) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(options.insecure);
    builder = match &options.proxy {
        Some(proxy) => match reqwest::Proxy::all(proxy.as_str()) {
            Ok(proxy) => builder.proxy(proxy),
            Err(err) => {
                warn!(%err, "ignoring unusable proxy URL");
                builder
            }
        },
        None => builder.no_proxy(),
    };
    builder.build().unwrap_or_else(|err| {
        warn!(%err, "falling back to a default HTTP client");
        reqwest::Client::new()
    })
}

async fn post_frames(
    client: &reqwest::Client,
    url: &str,
    role: Role,
    frames: &[Frame],
) -> Result<(), reqwest::Error> {
    let body = serde_json::json!({ "role": role, "message": frames });
    client
        .post(url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

/// Consumes the NDJSON stream, one frame per line, reopening after
/// `RETRY_DELAY` whenever it errors or ends.
async fn read_stream(client: reqwest::Client, url: String, events: EventSink) {
    loop {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let mut chunks = response.bytes_stream();
                let mut buf: Vec<u8> = Vec::new();
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(bytes) => {
                            buf.extend_from_slice(&bytes);
                            drain_lines(&mut buf, &events);
                        }
                        Err(err) => {
                            debug!(%err, "stream read error");
                            break;
                        }
                    }
                }
                debug!("stream ended; reopening");
            }
            Ok(response) => debug!(status = %response.status(), "stream request rejected"),
            Err(err) => debug!(%err, "stream request failed"),
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

fn drain_lines(buf: &mut Vec<u8>, events: &EventSink) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Frame>(line) {
            Ok(frame) => events.frame(frame),
            Err(err) => warn!(%err, "dropping malformed stream line"),
        }
    }
}

fn frame_size(frame: &Frame) -> usize {
    serde_json::to_string(frame).map(|text| text.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn drain_lines_parses_each_complete_line() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = EventSink {
            tx,
            connected: Arc::new(AtomicBool::new(false)),
        };

        let mut buf = Vec::new();
        buf.extend_from_slice(b"{\"type\":\"connect-end\",\"id\":\"a\"}\n{\"type\":\"connect-");
        drain_lines(&mut buf, &events);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Frame(Frame::ConnectEnd { id: "a".into() })
        );
        assert!(rx.try_recv().is_err());

        buf.extend_from_slice(b"end\",\"id\":\"b\"}\n");
        drain_lines(&mut buf, &events);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Frame(Frame::ConnectEnd { id: "b".into() })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_size_reflects_serialized_length() {
        let frame = Frame::ConnectEnd { id: "x".into() };
        assert_eq!(
            frame_size(&frame),
            serde_json::to_string(&frame).unwrap().len()
        );
    }
}
