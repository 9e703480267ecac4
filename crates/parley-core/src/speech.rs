use async_trait::async_trait;
use parley_protocol::{BrokerResult, SessionId, VoiceProfile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    pub session_id: SessionId,
    pub text: String,
    pub voice: VoiceProfile,
    pub blocking: bool,
    pub urgent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Playback ran to completion (blocking speech).
    Completed,
    /// Playback was dispatched to the audio device (async and urgent speech).
    Started,
    /// The engine declined to play (audio down, generator failure); the
    /// caller still resolves successfully.
    Dropped,
}

/// The audible channel as the inbox engine and presenter see it. The real
/// implementation owns subprocesses and the audio device; tests substitute a
/// recording fake.
#[async_trait]
pub trait SpeechSink: Send + Sync {
    /// Blocking speech returns at playback end, non-blocking at playback
    /// start. Urgent speech preempts whatever is playing first.
    async fn speak(&self, request: SpeechRequest) -> BrokerResult<SpeechOutcome>;

    /// Advance the scroll-readout generation. Readouts dispatched with an
    /// older token skip silently once they reach the device.
    fn begin_readout(&self) -> u64;

    /// Speak a highlighted option label. May interrupt a previous readout but
    /// never agent speech.
    async fn readout(&self, text: String, voice: VoiceProfile, token: u64);

    /// Warm the artifact cache so scrolling is instant.
    async fn pregenerate(&self, texts: Vec<String>, voice: VoiceProfile);

    /// Kill current playback, if any.
    fn stop(&self);
}
