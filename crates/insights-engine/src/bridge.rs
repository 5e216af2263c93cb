//! Push-to-pull bridge between a producer task (the run driver) and a
//! consumer iterating tokens.
//!
//! Tokens travel over an unbounded channel followed by exactly one internal
//! terminal slot. The trace context captured at creation is reactivated when
//! the stream ends so the completion event joins the caller's trace.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use insights_core::artifact::Token;
use insights_telemetry::TraceContext;

/// How a stream finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed { reason: String },
    TimedOut { after: Duration },
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::TimedOut { after } => write!(f, "timed out after {}s", after.as_secs()),
        }
    }
}

enum Slot {
    Token(Token),
    End(StreamOutcome),
}

struct ProducerState {
    ended: bool,
    /// Everything sent so far, for the completion event.
    output: String,
}

struct Inner {
    tx: mpsc::UnboundedSender<Slot>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Slot>>>,
    state: Mutex<ProducerState>,
    trace: TraceContext,
}

/// Producer side. Cheap to clone; dropping every clone without calling
/// [`StreamBridge::end`] terminates the consumer with no outcome.
#[derive(Clone)]
pub struct StreamBridge {
    inner: Arc<Inner>,
}

impl Default for StreamBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBridge {
    /// New bridge in a fresh trace.
    pub fn new() -> Self {
        Self::with_trace(TraceContext::new_root())
    }

    pub fn with_trace(trace: TraceContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(Some(rx)),
                state: Mutex::new(ProducerState {
                    ended: false,
                    output: String::new(),
                }),
                trace,
            }),
        }
    }

    pub fn trace_context(&self) -> &TraceContext {
        &self.inner.trace
    }

    /// Propagation carrier for the captured trace context.
    pub fn carrier(&self) -> HashMap<String, String> {
        self.inner.trace.to_carrier()
    }

    /// Append a token. Empty tokens and tokens sent after `end` are dropped
    /// and return `false`.
    pub fn send(&self, token: impl Into<Token>) -> bool {
        let token = token.into();
        if token.is_empty() {
            return false;
        }
        let mut state = self.inner.state.lock();
        if state.ended {
            return false;
        }
        match &token {
            Token::Text(text) => state.output.push_str(text),
            Token::Image(image) => {
                state.output.push('\n');
                state.output.push_str(&image.to_data_uri());
                state.output.push('\n');
            }
        }
        // A dropped consumer is not an error for the producer.
        let _ = self.inner.tx.send(Slot::Token(token));
        true
    }

    pub fn end(&self) -> bool {
        self.end_with(StreamOutcome::Completed)
    }

    /// Terminate the stream. Only the first call has an effect.
    pub fn end_with(&self, outcome: StreamOutcome) -> bool {
        let mut state = self.inner.state.lock();
        if state.ended {
            return false;
        }
        state.ended = true;

        let trace_span = self.inner.trace.reactivate();
        let span = tracing::info_span!(parent: &trace_span, "stream", function = "stream");
        let _enter = span.enter();
        let lines: Vec<&str> = state.output.split('\n').collect();
        info!(
            output = %serde_json::to_string(&lines).unwrap_or_default(),
            output_bytes = state.output.len(),
            outcome = %outcome,
            "stream ended"
        );

        let _ = self.inner.tx.send(Slot::End(outcome));
        true
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().ended
    }

    /// Accumulated output so far, images as data URIs.
    pub fn output(&self) -> String {
        self.inner.state.lock().output.clone()
    }

    /// Take the consumer side. Only the first call gets the tokens; later
    /// calls return an already finished stream.
    pub fn iterate(&self) -> TokenStream {
        TokenStream {
            rx: self.inner.rx.lock().take(),
            outcome: None,
        }
    }
}

/// Consumer side: yields tokens in send order, suspending while empty.
pub struct TokenStream {
    rx: Option<mpsc::UnboundedReceiver<Slot>>,
    outcome: Option<StreamOutcome>,
}

impl TokenStream {
    /// Set once the terminal slot has been consumed. `None` while still
    /// streaming, or if the producer vanished without ending the stream.
    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.rx.is_none()
    }

    /// Drain the stream.
    pub async fn collect_all(mut self) -> (Vec<Token>, Option<StreamOutcome>) {
        let mut tokens = Vec::new();
        while let Some(token) = self.next().await {
            tokens.push(token);
        }
        (tokens, self.outcome)
    }

    fn finish(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
    }
}

impl Stream for TokenStream {
    type Item = Token;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Token>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Ready(Some(Slot::Token(token))) => Poll::Ready(Some(token)),
            Poll::Ready(Some(Slot::End(outcome))) => {
                self.outcome = Some(outcome);
                self.finish();
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insights_core::artifact::ImageArtifact;
    use tracing_subscriber::layer::SubscriberExt;

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().filter_map(Token::as_text).collect()
    }

    #[tokio::test]
    async fn tokens_arrive_in_send_order() {
        let bridge = StreamBridge::new();
        for t in ["a", "b", "c"] {
            assert!(bridge.send(t));
        }
        assert!(bridge.end());

        let (tokens, outcome) = bridge.iterate().collect_all().await;
        assert_eq!(texts(&tokens), ["a", "b", "c"]);
        assert_eq!(outcome, Some(StreamOutcome::Completed));
    }

    #[tokio::test]
    async fn zero_tokens_then_end() {
        let bridge = StreamBridge::new();
        bridge.end();
        let (tokens, outcome) = bridge.iterate().collect_all().await;
        assert!(tokens.is_empty());
        assert_eq!(outcome, Some(StreamOutcome::Completed));
    }

    #[tokio::test]
    async fn empty_tokens_and_late_sends_are_dropped() {
        let bridge = StreamBridge::new();
        assert!(!bridge.send(""));
        assert!(bridge.send("x"));
        assert!(bridge.end_with(StreamOutcome::Failed {
            reason: "boom".into()
        }));
        assert!(!bridge.end());
        assert!(!bridge.send("late"));
        assert!(bridge.is_ended());

        let mut stream = bridge.iterate();
        assert_eq!(stream.next().await, Some(Token::from("x")));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
        assert_eq!(
            stream.outcome(),
            Some(&StreamOutcome::Failed {
                reason: "boom".into()
            })
        );
    }

    #[tokio::test]
    async fn second_iterate_is_already_finished() {
        let bridge = StreamBridge::new();
        bridge.send("only once");
        bridge.end();
        let first = bridge.iterate();
        let second = bridge.iterate();
        assert!(second.is_finished());
        assert!(second.collect_all().await.0.is_empty());
        assert_eq!(first.collect_all().await.0.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_waits_for_slow_producer() {
        let bridge = StreamBridge::new();
        let producer = bridge.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                producer.send(format!("t{i}"));
            }
            producer.end_with(StreamOutcome::TimedOut {
                after: Duration::from_secs(120),
            });
        });

        let (tokens, outcome) = bridge.iterate().collect_all().await;
        assert_eq!(texts(&tokens), ["t0", "t1", "t2", "t3", "t4"]);
        assert_eq!(
            outcome,
            Some(StreamOutcome::TimedOut {
                after: Duration::from_secs(120)
            })
        );
    }

    #[tokio::test]
    async fn producer_on_os_thread() {
        let bridge = StreamBridge::new();
        let stream = bridge.iterate();
        let producer = bridge.clone();
        let thread = std::thread::spawn(move || {
            for i in 0..100 {
                producer.send(i.to_string());
            }
            producer.end();
        });

        let (tokens, outcome) = stream.collect_all().await;
        thread.join().unwrap();
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(texts(&tokens), expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(outcome, Some(StreamOutcome::Completed));
    }

    #[tokio::test]
    async fn dropped_producer_terminates_without_outcome() {
        let bridge = StreamBridge::new();
        let stream = bridge.iterate();
        bridge.send("partial");
        drop(bridge);

        let (tokens, outcome) = stream.collect_all().await;
        assert_eq!(texts(&tokens), ["partial"]);
        assert_eq!(outcome, None);
    }

    #[test]
    fn output_records_images_as_data_uris() {
        let bridge = StreamBridge::new();
        bridge.send("chart:");
        bridge.send(ImageArtifact::from_bytes(vec![0x89, b'P', b'N', b'G']));
        let output = bridge.output();
        assert!(output.starts_with("chart:\ndata:image/png;base64,"));
        assert!(output.ends_with('\n'));
    }

    #[test]
    fn end_event_lands_in_captured_trace() {
        let sink = Arc::new(insights_telemetry::SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(insights_telemetry::SqliteLogLayer::new(
            sink.clone(),
            tracing::Level::INFO,
        ));

        let bridge = StreamBridge::new();
        let trace_id = bridge.trace_context().trace_id.clone();
        tracing::subscriber::with_default(subscriber, || {
            bridge.send("line 1\nline 2");
            bridge.end();
        });

        let records = sink
            .query(&insights_telemetry::LogQuery {
                trace_id: Some(trace_id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "stream ended");
        assert!(records[0].fields.as_deref().unwrap().contains("line 2"));
    }

    #[test]
    fn end_event_ignores_the_callers_span() {
        let sink = Arc::new(insights_telemetry::SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(insights_telemetry::SqliteLogLayer::new(
            sink.clone(),
            tracing::Level::INFO,
        ));

        let bridge = StreamBridge::new();
        let trace_id = bridge.trace_context().trace_id.clone();
        tracing::subscriber::with_default(subscriber, || {
            let other = tracing::info_span!(
                "other_request",
                run_id = "run_other",
                thread_id = "thread_other",
                trace_id = "0af7651916cd43dd8448eb211c80319c",
            );
            let _guard = other.enter();
            bridge.send("answer");
            bridge.end();
        });

        let records = sink
            .query(&insights_telemetry::LogQuery::default())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "stream ended");
        assert_eq!(records[0].trace_id.as_deref(), Some(trace_id.as_str()));
        assert_eq!(records[0].run_id, None);
        assert_eq!(records[0].thread_id, None);
    }

    #[test]
    fn carrier_round_trips() {
        let bridge = StreamBridge::new();
        let restored = TraceContext::from_carrier(&bridge.carrier()).unwrap();
        assert_eq!(&restored, bridge.trace_context());
    }
}
