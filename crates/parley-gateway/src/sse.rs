use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use parley_eventbus::EventEnvelope;
use tokio::sync::broadcast;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// One delimited SSE record: `event: <kind>\ndata: <json>\n\n`.
pub fn event_record(envelope: &EventEnvelope) -> Bytes {
    let data = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_owned());
    Bytes::from(format!("event: {}\ndata: {data}\n\n", envelope.event.kind()))
}

/// Marker injected into a subscriber's stream when its cursor fell off the
/// ring; the subscriber re-reads full state via the REST snapshot.
pub fn lag_record(skipped: u64) -> Bytes {
    Bytes::from(format!(
        "event: lag\ndata: {{\"kind\":\"lag\",\"skipped\":{skipped}}}\n\n"
    ))
}

pub fn heartbeat_record() -> Bytes {
    Bytes::from_static(b"event: heartbeat\ndata: {\"kind\":\"heartbeat\"}\n\n")
}

/// Turn a bus subscription into the streaming response body. Each subscriber
/// owns its cursor; lagging converts to a `lag` marker instead of stalling
/// the bus, and a heartbeat fires on quiet channels.
pub fn event_stream(
    mut receiver: broadcast::Receiver<EventEnvelope>,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                event = receiver.recv() => match event {
                    Ok(envelope) => yield Ok::<Bytes, Infallible>(event_record(&envelope)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        yield Ok(lag_record(skipped));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => yield Ok(heartbeat_record()),
            }
        }
    }
}

pub fn sse_response<S>(stream: S) -> Response
where
    S: futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, Body::from_stream(stream)).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use parley_eventbus::{BrokerEventBus, BrokerEventBusConfig};
    use parley_protocol::{BrokerEvent, SessionId};
    use tokio::time::timeout;

    use super::{event_record, event_stream, heartbeat_record, lag_record};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn event_record_is_a_delimited_sse_frame() {
        let bus = BrokerEventBus::default();
        let envelope = bus.publish(
            Some(SessionId::new("sess-a")),
            BrokerEvent::SelectionMade {
                label: "Pear".to_owned(),
                summary: "fruit".to_owned(),
            },
        );

        let record = event_record(&envelope);
        let text = String::from_utf8(record.to_vec()).expect("utf8 record");
        assert!(text.starts_with("event: selection_made\ndata: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"label\":\"Pear\""));
        assert!(text.contains("\"sequence\":1"));
    }

    #[test]
    fn marker_records_are_well_formed() {
        let lag = String::from_utf8(lag_record(7).to_vec()).expect("utf8 lag");
        assert_eq!(lag, "event: lag\ndata: {\"kind\":\"lag\",\"skipped\":7}\n\n");

        let heartbeat = String::from_utf8(heartbeat_record().to_vec()).expect("utf8 heartbeat");
        assert!(heartbeat.starts_with("event: heartbeat\n"));
    }

    #[tokio::test]
    async fn stream_emits_published_events_in_order() {
        let bus = Arc::new(BrokerEventBus::default());
        let mut stream = Box::pin(event_stream(bus.subscribe()));

        bus.publish(None, BrokerEvent::PulseDown);
        bus.publish(None, BrokerEvent::PulseRecovered);

        let first = timeout(TEST_TIMEOUT, stream.next())
            .await
            .expect("first record timed out")
            .expect("stream open")
            .expect("infallible");
        let second = timeout(TEST_TIMEOUT, stream.next())
            .await
            .expect("second record timed out")
            .expect("stream open")
            .expect("infallible");

        assert!(String::from_utf8_lossy(&first).contains("pulse_down"));
        assert!(String::from_utf8_lossy(&second).contains("pulse_recovered"));
    }

    #[tokio::test]
    async fn slow_subscriber_gets_a_lag_marker_not_a_stall() {
        let bus = Arc::new(BrokerEventBus::new(BrokerEventBusConfig {
            buffer_capacity: 1,
        }));
        let receiver = bus.subscribe();

        for _ in 0..8 {
            bus.publish(None, BrokerEvent::Heartbeat);
        }

        let mut stream = Box::pin(event_stream(receiver));
        let record = timeout(TEST_TIMEOUT, stream.next())
            .await
            .expect("record timed out")
            .expect("stream open")
            .expect("infallible");
        assert!(String::from_utf8_lossy(&record).starts_with("event: lag\n"));
    }
}
