use super::listener::{EventBuffer, Listener, ListenerFactory};
use crate::domain::Value;
use crate::engine::cancel::CancelToken;
use crate::engine::context::Context;
use crate::engine::resolve::resolve;
use reqwest::header::ACCEPT;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

const DATA_PREFIX: &str = "data: ";

/// Server-sent-events reader. One long-lived GET; every `data: ` line is
/// buffered as a string with the prefix stripped.
pub struct SseListener {
    url: String,
    buffer: EventBuffer,
    stop: CancelToken,
    task: JoinHandle<()>,
}

impl SseListener {
    pub fn connect(
        client: reqwest::Client,
        url: impl Into<String>,
        capacity: usize,
        run: CancelToken,
    ) -> Arc<Self> {
        let url = url.into();
        let buffer = EventBuffer::new(capacity);
        let stop = CancelToken::new();
        let task = tokio::spawn(read_stream(
            client,
            url.clone(),
            buffer.clone(),
            stop.clone(),
            run,
        ));
        Arc::new(Self {
            url,
            buffer,
            stop,
            task,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the background reader has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Listener for SseListener {
    fn events(&self) -> Vec<Value> {
        self.buffer.snapshot()
    }

    fn events_count(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&self) {
        self.buffer.clear();
    }

    fn stop(&self) {
        if self.stop.cancel() {
            tracing::debug!(url = %self.url, "stopping event stream");
        }
    }
}

async fn read_stream(
    client: reqwest::Client,
    url: String,
    buffer: EventBuffer,
    stop: CancelToken,
    run: CancelToken,
) {
    let request = client.get(&url).header(ACCEPT, "text/event-stream").send();
    let response = tokio::select! {
        _ = stop.cancelled() => return,
        _ = run.cancelled() => return,
        response = request => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%url, error = %err, "event stream request failed");
            return;
        }
    };
    if !response.status().is_success() {
        tracing::warn!(%url, status = %response.status(), "event stream refused");
        return;
    }

    let stream = response.bytes_stream();
    tokio::pin!(stream);
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = stop.cancelled() => break,
            _ = run.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                pending.extend_from_slice(&bytes);
                while let Some(end) = pending.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if let Some(data) = line.strip_prefix(DATA_PREFIX) {
                        buffer.push(Value::from(data));
                    }
                }
            }
            Some(Err(err)) => {
                tracing::warn!(%url, error = %err, "event stream read failed");
                break;
            }
            None => break,
        }
    }
    tracing::debug!(%url, "event stream closed");
}

/// Factory for an SSE listener. `url` may be a template or any resolvable;
/// paths starting with `/` are joined to the suite host.
pub fn sse(url: impl Into<Value>) -> ListenerFactory {
    let url = url.into();
    Arc::new(move |ctx: &Context| {
        let resolved = resolve(&url, ctx)?.to_text();
        let target = if resolved.starts_with('/') {
            format!("{}{}", ctx.host().trim_end_matches('/'), resolved)
        } else {
            resolved
        };
        let listener: Arc<dyn Listener> = SseListener::connect(
            reqwest::Client::new(),
            target,
            ctx.listener_buffer(),
            ctx.cancel_token(),
        );
        Ok(listener)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::time::Duration;

    async fn wait_finished(listener: &SseListener) {
        for _ in 0..400 {
            if listener.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event stream reader did not finish");
    }

    #[tokio::test]
    async fn data_lines_are_buffered_without_prefix() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/events")
                    .header("accept", "text/event-stream");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body("event: ping\ndata: one\n\n: comment\ndata: two\r\n\n");
            })
            .await;

        let listener = SseListener::connect(
            reqwest::Client::new(),
            server.url("/events"),
            16,
            CancelToken::new(),
        );
        wait_finished(&listener).await;

        assert_eq!(listener.events(), vec![Value::from("one"), Value::from("two")]);
        listener.stop();
        listener.stop();
    }

    #[tokio::test]
    async fn non_success_status_ends_the_reader() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/events");
                then.status(503).body("data: ignored\n");
            })
            .await;

        let listener = SseListener::connect(
            reqwest::Client::new(),
            server.url("/events"),
            16,
            CancelToken::new(),
        );
        wait_finished(&listener).await;
        assert_eq!(listener.events_count(), 0);
    }
}
