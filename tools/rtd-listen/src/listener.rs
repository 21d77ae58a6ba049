// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscribe-and-print loop, independent of the broker client.

use rtd_logger::StopHandle;
use std::io::{self, Write};
use thiserror::Error;

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("subscription to '{topic}' refused: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("connection lost: {0}")]
    Connection(String),

    #[error("output error: {0}")]
    Output(#[from] io::Error),
}

/// Something that delivers messages for a topic.
#[allow(async_fn_in_trait)]
pub trait MessageSource {
    /// Connect if needed and subscribe; resolves once the broker acknowledged.
    async fn subscribe(&mut self, topic: &str) -> Result<(), ListenError>;

    /// Wait for the next message. `Ok(None)` means the source was closed.
    async fn next_message(&mut self) -> Result<Option<Message>, ListenError>;

    async fn disconnect(&mut self);
}

pub fn format_message(message: &Message) -> String {
    format!(
        "Message received on topic '{}': {}",
        message.topic,
        String::from_utf8_lossy(&message.payload)
    )
}

/// Subscribe to `topic` and print messages to `out` until `stop` fires.
///
/// Returns the number of messages printed.
pub async fn run<S, W>(
    source: &mut S,
    topic: &str,
    out: &mut W,
    stop: &StopHandle,
) -> Result<u64, ListenError>
where
    S: MessageSource,
    W: Write,
{
    source.subscribe(topic).await?;
    tracing::info!(topic, "Subscribed, listening for messages (Ctrl+C to exit)");

    let mut received = 0u64;
    let result = loop {
        let next = tokio::select! {
            _ = stop.stopped() => break Ok(received),
            next = source.next_message() => next,
        };
        match next {
            Ok(Some(message)) => {
                if let Err(e) = writeln!(out, "{}", format_message(&message)).and_then(|_| out.flush())
                {
                    break Err(ListenError::Output(e));
                }
                received += 1;
            }
            Ok(None) => break Ok(received),
            Err(e) => break Err(e),
        }
    };

    tracing::info!("Disconnecting");
    source.disconnect().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedSource {
        subscribe_error: Option<ListenError>,
        script: VecDeque<Result<Option<Message>, ListenError>>,
        subscribed: Vec<String>,
        disconnects: usize,
    }

    impl ScriptedSource {
        fn with_messages(messages: Vec<Result<Option<Message>, ListenError>>) -> Self {
            Self {
                script: messages.into(),
                ..Default::default()
            }
        }
    }

    impl MessageSource for ScriptedSource {
        async fn subscribe(&mut self, topic: &str) -> Result<(), ListenError> {
            if let Some(e) = self.subscribe_error.take() {
                return Err(e);
            }
            self.subscribed.push(topic.to_string());
            Ok(())
        }

        async fn next_message(&mut self) -> Result<Option<Message>, ListenError> {
            match self.script.pop_front() {
                Some(next) => next,
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&mut self) {
            self.disconnects += 1;
        }
    }

    fn msg(topic: &str, payload: &[u8]) -> Message {
        Message {
            topic: topic.into(),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prints_messages_until_stopped() {
        let mut source = ScriptedSource::with_messages(vec![
            Ok(Some(msg("test/helloOrange", br#"{"temp": 21.0}"#))),
            Ok(Some(msg("test/helloOrange", b"hi"))),
        ]);
        let stop = StopHandle::new();
        let mut out = Vec::new();

        let (result, _) = tokio::join!(
            run(&mut source, "test/helloOrange", &mut out, &stop),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                stop.stop();
            }
        );

        assert_eq!(result.unwrap(), 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Message received on topic 'test/helloOrange': {\"temp\": 21.0}\n\
             Message received on topic 'test/helloOrange': hi\n"
        );
        assert_eq!(source.subscribed, vec!["test/helloOrange"]);
        assert_eq!(source.disconnects, 1);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let line = format_message(&msg("t", &[b'h', 0xFF]));
        assert_eq!(line, "Message received on topic 't': h\u{FFFD}");
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_an_error() {
        let mut source = ScriptedSource {
            subscribe_error: Some(ListenError::Connect("connection refused".into())),
            ..Default::default()
        };
        let stop = StopHandle::new();
        let mut out = Vec::new();

        let err = run(&mut source, "test/helloOrange", &mut out, &stop)
            .await
            .unwrap_err();

        assert!(matches!(err, ListenError::Connect(_)));
        assert!(out.is_empty());
        assert_eq!(source.disconnects, 0);
    }

    #[tokio::test]
    async fn test_lost_connection_disconnects_and_fails() {
        let mut source = ScriptedSource::with_messages(vec![
            Ok(Some(msg("a", b"1"))),
            Err(ListenError::Connection("reset by peer".into())),
        ]);
        let stop = StopHandle::new();
        let mut out = Vec::new();

        let err = run(&mut source, "a", &mut out, &stop).await.unwrap_err();

        assert!(matches!(err, ListenError::Connection(_)));
        assert_eq!(out.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(source.disconnects, 1);
    }

    #[tokio::test]
    async fn test_already_stopped_returns_immediately() {
        let mut source = ScriptedSource::default();
        let stop = StopHandle::new();
        stop.stop();
        let mut out = Vec::new();

        let n = run(&mut source, "a", &mut out, &stop).await.unwrap();

        assert_eq!(n, 0);
        assert_eq!(source.disconnects, 1);
    }
}
