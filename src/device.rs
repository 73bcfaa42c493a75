//! Background read loop over the acceptor controller transport.
//!
//! [`PulseDeviceClient`] owns the transport and a dedicated task that reads
//! raw bytes, accumulates them through the framing state machine, decodes
//! complete frames, and pushes the resulting [`PulseEvent`]s onto a bounded
//! channel. The channel makes ordering and backpressure explicit: events are
//! delivered in the order frames come off the wire, and a slow consumer
//! pauses the read loop rather than dropping events.
//!
//! The loop's error discipline:
//!
//! - read timeouts are "no data yet" and the loop re-polls;
//! - a closed transport (EOF, broken pipe) exits the loop cleanly;
//! - any other I/O fault is logged at error level and retried after a brief
//!   backoff - the loop itself is never fatal.

use crate::decode::decode_pulse_payload;
use crate::event::PulseEvent;
use crate::framing::FrameAccumulator;
use crate::serial::DynSerial;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Backoff applied after an unexpected transport I/O error.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Shared "when did bytes last arrive" marker for the liveness heuristic.
pub type ActivityMarker = Arc<Mutex<Option<Instant>>>;

/// Handle to the background read loop for one transport session.
pub struct PulseDeviceClient {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PulseDeviceClient {
    /// Spawn the read loop over `transport`.
    ///
    /// Decoded events are delivered on `events`; `activity` is updated on
    /// every successful read so health checks can distinguish "port open"
    /// from "device actually talking". The loop exits when the receiver side
    /// of `events` is dropped, the transport closes, or
    /// [`stop`](Self::stop) is called.
    pub fn spawn(
        transport: DynSerial,
        events: mpsc::Sender<PulseEvent>,
        read_timeout: Duration,
        activity: ActivityMarker,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(read_loop(
            transport,
            events,
            read_timeout,
            activity,
            shutdown_rx,
        ));
        Self { shutdown, handle }
    }

    /// Signal the read loop to stop and wait for it to exit, bounded by
    /// `timeout`. On expiry the task is aborted rather than joined forever,
    /// which drops (and thereby force-closes) the transport.
    pub async fn stop(self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            tracing::warn!(?timeout, "read loop did not exit in time, aborting task");
            abort.abort();
        }
    }

    /// Abort the read loop without waiting. Used on disposal.
    pub fn abort(&self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

async fn read_loop(
    mut transport: DynSerial,
    events: mpsc::Sender<PulseEvent>,
    read_timeout: Duration,
    activity: ActivityMarker,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut accumulator = FrameAccumulator::new();
    let mut read_buf = [0u8; 256];

    tracing::debug!("read loop started");
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::debug!("read loop shutdown requested");
                break;
            }
            result = tokio::time::timeout(read_timeout, transport.read(&mut read_buf)) => {
                match result {
                    // Timeout: no data yet, re-poll.
                    Err(_) => continue,
                    Ok(Ok(0)) => {
                        tracing::info!("transport closed, exiting read loop");
                        break;
                    }
                    Ok(Ok(n)) => {
                        *activity.lock() = Some(Instant::now());
                        accumulator.push_bytes(&read_buf[..n]);
                        while let Some(payload) = accumulator.next_frame() {
                            if let Some(event) = decode_pulse_payload(&payload) {
                                if events.send(event).await.is_err() {
                                    tracing::debug!("event receiver gone, exiting read loop");
                                    return;
                                }
                            }
                        }
                    }
                    Ok(Err(e)) if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => continue,
                    Ok(Err(e)) if matches!(
                        e.kind(),
                        std::io::ErrorKind::BrokenPipe
                            | std::io::ErrorKind::NotConnected
                            | std::io::ErrorKind::UnexpectedEof
                    ) => {
                        tracing::info!(error = %e, "transport disconnected, exiting read loop");
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "transport read error, backing off");
                        tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AccepterId, UNIQUE_ID_LEN};
    use crate::framing::{FRAME_CMD_PULSE, FRAME_TYPE_PULSE};
    use tokio::io::AsyncWriteExt;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![FRAME_TYPE_PULSE, FRAME_CMD_PULSE];
        bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn current_payload(identifier: u8, count: u16, id: [u8; UNIQUE_ID_LEN]) -> Vec<u8> {
        let mut payload = vec![identifier, 0, 0, 0];
        payload.extend_from_slice(&count.to_le_bytes());
        payload.extend_from_slice(&id);
        payload
    }

    fn spawn_client(
        buffer: usize,
    ) -> (
        tokio::io::DuplexStream,
        PulseDeviceClient,
        mpsc::Receiver<PulseEvent>,
        ActivityMarker,
    ) {
        let (host, device) = tokio::io::duplex(buffer);
        let (tx, rx) = mpsc::channel(16);
        let activity: ActivityMarker = Arc::new(Mutex::new(None));
        let client = PulseDeviceClient::spawn(
            Box::new(device),
            tx,
            Duration::from_millis(20),
            activity.clone(),
        );
        (host, client, rx, activity)
    }

    #[tokio::test]
    async fn test_decodes_frame_after_garbage_prefix() {
        let (mut host, client, mut rx, activity) = spawn_client(256);

        let mut stream = vec![0xde, 0xad];
        stream.extend_from_slice(&frame(&current_payload(0x01, 5, [1u8; UNIQUE_ID_LEN])));
        host.write_all(&stream).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.accepter, AccepterId::Bill);
        assert_eq!(event.raw_count, 5);
        assert!(activity.lock().is_some());

        client.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_truncated_frame_yields_no_event_until_complete() {
        let (mut host, client, mut rx, _activity) = spawn_client(256);

        let full = frame(&current_payload(0x00, 3, [2u8; UNIQUE_ID_LEN]));
        // Header claims a 16-byte payload but only 10 arrive.
        host.write_all(&full[..4 + 10]).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );

        host.write_all(&full[4 + 10..]).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.raw_count, 3);

        client.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_coalesced_frames_preserve_order() {
        let (mut host, client, mut rx, _activity) = spawn_client(512);

        let mut stream = Vec::new();
        for count in [1u16, 2, 3] {
            let mut id = [0u8; UNIQUE_ID_LEN];
            id[0] = count as u8;
            stream.extend_from_slice(&frame(&current_payload(0x01, count, id)));
        }
        host.write_all(&stream).await.unwrap();

        for expected in [1u16, 2, 3] {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.raw_count, expected);
        }

        client.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_transport_close_exits_loop_cleanly() {
        let (host, client, mut rx, _activity) = spawn_client(64);
        drop(host);

        // Channel closes once the loop exits and drops its sender.
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(got, Ok(None)));

        client.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_joins_promptly_with_idle_transport() {
        let (_host, client, _rx, _activity) = spawn_client(64);
        tokio::time::timeout(Duration::from_secs(1), client.stop(Duration::from_secs(1)))
            .await
            .unwrap();
    }
}
