//! Per-session pipeline tasks
//!
//! Uplink: frame stream -> encoder -> transport, with a volume report per
//! frame. Downlink: channel events -> decoder -> playback scheduler. Both
//! run as tokio tasks inside the session span and stop on a shared watch
//! signal. Unexpected ends are reported on an mpsc channel so the
//! controller can fail or close the session.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::audio::capture::{AudioCaptureSource, CaptureDevice, FrameStream};
use crate::audio::playback::OutputDevice;
use crate::audio::scheduler::PlaybackScheduler;
use crate::codec::{DownlinkDecoder, UplinkEncoder};
use crate::error::{AudioError, Error};
use crate::network::channel::{DuplexChannel, InboundStream};
use crate::network::transport::{ChunkSender, Downlink, DownlinkEnd, LiveTransportSession};
use crate::session::{SessionInfo, SessionObserver};

/// Why a session stopped on its own
#[derive(Debug)]
pub(crate) enum SessionEnd {
    RemoteClosed,
    Failed(Error),
}

/// Everything one connected session owns
pub(crate) struct ActiveSession<D: CaptureDevice, Ch: DuplexChannel> {
    pub info: SessionInfo,
    pub generation: u64,
    capture: AudioCaptureSource<D>,
    transport: Arc<LiveTransportSession<Ch>>,
    stop_tx: watch::Sender<bool>,
    uplink: Option<JoinHandle<()>>,
    downlink: Option<JoinHandle<DownlinkEnd>>,
}

/// Inputs for starting the pipeline of a freshly opened session
pub(crate) struct PipelineParts<D: CaptureDevice, Ch: DuplexChannel, O: OutputDevice> {
    pub info: SessionInfo,
    pub generation: u64,
    pub capture: AudioCaptureSource<D>,
    pub frames: FrameStream,
    pub transport: LiveTransportSession<Ch>,
    pub inbound: InboundStream,
    pub output: Arc<O>,
    pub observer: Arc<dyn SessionObserver>,
}

impl<D: CaptureDevice, Ch: DuplexChannel> ActiveSession<D, Ch> {
    /// Spawn the uplink and downlink tasks. Must be called within a runtime.
    pub fn start<O: OutputDevice>(parts: PipelineParts<D, Ch, O>, ends: mpsc::UnboundedSender<SessionEnd>) -> Self {
        let PipelineParts {
            info,
            generation,
            capture,
            mut frames,
            transport,
            inbound,
            output,
            observer,
        } = parts;

        // The microphone only streams once the channel is open
        let mut discarded = 0usize;
        while frames.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!("Discarded {} frames captured while connecting", discarded);
        }

        let span = tracing::info_span!("session", id = %info.id);
        let (stop_tx, stop_rx) = watch::channel(false);
        let transport = Arc::new(transport);

        let uplink = tokio::spawn(
            run_uplink(
                frames,
                UplinkEncoder::new(info.config.uplink_rate_hz),
                transport.sender(),
                observer,
                stop_rx.clone(),
                ends.clone(),
            )
            .instrument(span.clone()),
        );

        let downlink = Downlink::new(
            DownlinkDecoder::new(info.config.downlink_rate_hz),
            PlaybackScheduler::new(output),
        );
        let downlink = tokio::spawn(
            async move {
                let end = downlink.run(inbound, stop_rx).await;
                match &end {
                    DownlinkEnd::Stopped => {}
                    DownlinkEnd::RemoteClosed => {
                        let _ = ends.send(SessionEnd::RemoteClosed);
                    }
                    DownlinkEnd::Failed(e) => {
                        let _ = ends.send(SessionEnd::Failed(e.clone().into()));
                    }
                }
                end
            }
            .instrument(span),
        );

        Self {
            info,
            generation,
            capture,
            transport,
            stop_tx,
            uplink: Some(uplink),
            downlink: Some(downlink),
        }
    }

    /// Stop both paths and release the channel and the device
    pub async fn shutdown(mut self) {
        let _ = self.stop_tx.send(true);

        if let Some(uplink) = self.uplink.take() {
            let _ = uplink.await;
        }
        self.transport.close().await;
        self.capture.stop();

        // Flushes playback on the way out
        if let Some(downlink) = self.downlink.take() {
            let _ = downlink.await;
        }

        let stats = self.transport.stats();
        tracing::info!(
            session = %self.info.id,
            "Session shut down after {}s ({} chunks sent, {} dropped)",
            (chrono::Utc::now() - self.info.started_at).num_seconds(),
            stats.chunks_sent,
            stats.chunks_dropped
        );
    }

    /// Best-effort synchronous teardown for when the controller is dropped
    pub fn abort(mut self) {
        let _ = self.stop_tx.send(true);
        self.capture.stop();

        let transport = self.transport.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { transport.close().await });
            }
            Err(_) => {
                if let Some(uplink) = self.uplink.take() {
                    uplink.abort();
                }
                if let Some(downlink) = self.downlink.take() {
                    downlink.abort();
                }
            }
        }
    }
}

async fn run_uplink<Ch: DuplexChannel>(
    mut frames: FrameStream,
    encoder: UplinkEncoder,
    sender: ChunkSender<Ch>,
    observer: Arc<dyn SessionObserver>,
    mut stop: watch::Receiver<bool>,
    ends: mpsc::UnboundedSender<SessionEnd>,
) {
    let mut frames_sent = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            frame = frames.recv() => match frame {
                Some(frame) => {
                    let (chunk, volume) = encoder.encode(&frame);
                    if sender.send(&chunk) {
                        frames_sent += 1;
                    }
                    observer.on_volume_change(volume);
                }
                None => {
                    tracing::error!("Capture stream ended unexpectedly");
                    let _ = ends.send(SessionEnd::Failed(AudioError::StreamEnded.into()));
                    break;
                }
            },
        }
    }

    tracing::debug!("Uplink stopped after {} frames", frames_sent);
}
