use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parley_core::{SpeechOutcome, SpeechRequest, SpeechSink};
use parley_eventbus::BrokerEventBus;
use parley_protocol::{BrokerError, BrokerEvent, BrokerResult, SessionId, SettingsSnapshot, VoiceProfile};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::cache::{ArtifactCache, ArtifactKey};
use crate::recovery::{AudioHealth, RecoveryPolicy, RecoveryTracker};

const GENERATOR_TIMEOUT: Duration = Duration::from_secs(30);
const BASE_WORDS_PER_MINUTE: f32 = 160.0;

#[derive(Debug, Clone)]
pub struct SpeechEngineConfig {
    /// Player argv; `{artifact}` is replaced with the audio file path.
    pub player_command: Vec<String>,
    /// Generator argv; `{text}`, `{voice}`, `{style}`, `{speed}`,
    /// `{speed_wpm}`, `{model}` and `{out}` are substituted. Without `{out}`
    /// stdout is captured into the output file.
    pub generator_command: Vec<String>,
    pub fallback_generator_command: Option<Vec<String>>,
    pub voice: String,
    pub style: String,
    pub speed: f32,
    pub model: String,
    pub cache_dir: PathBuf,
    pub pregenerate_concurrency: usize,
    pub recovery: RecoveryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackCategory {
    Agent,
    Readout,
}

#[derive(Debug)]
struct Playback {
    pid: Option<u32>,
    category: PlaybackCategory,
    preempted: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy)]
struct PlaybackEnd {
    success: bool,
    preempted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayOutcome {
    Completed,
    Started,
    Preempted,
    /// The player ran and exited non-zero; the joiner has already published
    /// `speech_failed` and fed the recovery machine.
    Failed,
}

#[derive(Debug)]
struct EngineInner {
    config: SpeechEngineConfig,
    cache: ArtifactCache,
    bus: Arc<BrokerEventBus>,
    /// Serialises entry to "start playback". Held only to mutate the
    /// playback slot, never across a spawn or a kill.
    start_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Playback>>,
    /// Bumped whenever the playback slot or the urgent counter changes.
    /// Waiters use a watch subscription so a bump between check and await is
    /// never missed.
    epoch: watch::Sender<u64>,
    urgent_pending: AtomicUsize,
    readout_generation: AtomicU64,
    recovery: Mutex<RecoveryTracker>,
    temp_nonce: AtomicU64,
}

impl EngineInner {
    fn bump_epoch(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }
}

/// One audible channel shared across all sessions. Cheap to clone; all state
/// lives behind the shared inner.
#[derive(Clone)]
pub struct SpeechEngine {
    inner: Arc<EngineInner>,
}

impl SpeechEngine {
    pub fn new(config: SpeechEngineConfig, bus: Arc<BrokerEventBus>) -> std::io::Result<Self> {
        let cache = ArtifactCache::new(&config.cache_dir)?;
        let recovery = RecoveryTracker::new(config.recovery.clone());
        let (epoch, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                cache,
                bus,
                start_lock: tokio::sync::Mutex::new(()),
                current: Mutex::new(None),
                epoch,
                urgent_pending: AtomicUsize::new(0),
                readout_generation: AtomicU64::new(0),
                recovery: Mutex::new(recovery),
                temp_nonce: AtomicU64::new(0),
            }),
        })
    }

    pub fn health(&self) -> AudioHealth {
        self.inner
            .recovery
            .lock()
            .expect("recovery tracker lock poisoned")
            .health()
    }

    pub fn settings(&self) -> SettingsSnapshot {
        let config = &self.inner.config;
        SettingsSnapshot {
            voice: config.voice.clone(),
            style: config.style.clone(),
            speed: config.speed,
            model: config.model.clone(),
        }
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Periodic maintenance: five quiet cooldowns reset the failure streak.
    pub fn health_tick(&self) {
        let should_emit = self
            .inner
            .recovery
            .lock()
            .expect("recovery tracker lock poisoned")
            .maybe_reset(Instant::now());
        if should_emit {
            self.inner.bus.publish(None, BrokerEvent::PulseRecovered);
        }
    }

    /// Cached artifact for the text, generating (with fallback) on a miss.
    /// Returns None when generation fails; the caller decides how loudly.
    async fn resolve_artifact(&self, text: &str, voice: &VoiceProfile) -> Option<PathBuf> {
        let config = &self.inner.config;
        let key = ArtifactKey {
            text: text.to_owned(),
            voice: voice.voice.clone().unwrap_or_else(|| config.voice.clone()),
            style: voice.style.clone().unwrap_or_else(|| config.style.clone()),
            speed_millis: (config.speed * 1000.0) as u32,
            model: config.model.clone(),
        };
        let fingerprint = key.fingerprint();
        if let Some(path) = self.inner.cache.lookup(&fingerprint) {
            return Some(path);
        }

        match self
            .generate(&config.generator_command.clone(), &key, &fingerprint)
            .await
        {
            Some(path) => Some(path),
            None => {
                let fallback = config.fallback_generator_command.clone()?;
                debug!("primary generator failed; trying offline fallback");
                self.generate(&fallback, &key, &fingerprint).await
            }
        }
    }

    async fn generate(
        &self,
        template: &[String],
        key: &ArtifactKey,
        fingerprint: &str,
    ) -> Option<PathBuf> {
        let inner = &self.inner;
        if template.is_empty() {
            return None;
        }
        let nonce = inner.temp_nonce.fetch_add(1, Ordering::Relaxed);
        let temp = inner.cache.temp_path(fingerprint, nonce);
        let temp_str = temp.to_string_lossy().into_owned();
        let speed = key.speed_millis as f32 / 1_000.0;
        let speed_str = speed.to_string();
        let wpm_str = ((BASE_WORDS_PER_MINUTE * speed).round() as u32).to_string();
        let vars: Vec<(&str, &str)> = vec![
            ("{text}", key.text.as_str()),
            ("{voice}", key.voice.as_str()),
            ("{style}", key.style.as_str()),
            ("{model}", key.model.as_str()),
            ("{speed}", speed_str.as_str()),
            ("{speed_wpm}", wpm_str.as_str()),
            ("{out}", temp_str.as_str()),
        ];
        let argv = substitute(template, &vars);
        let captures_stdout = !template.iter().any(|arg| arg.contains("{out}"));

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .stdout(if captures_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                warn!(%error, generator = %argv[0], "speech generator did not start");
                return None;
            }
        };

        let output = match tokio::time::timeout(GENERATOR_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                warn!(%error, "speech generator failed");
                let _ = std::fs::remove_file(&temp);
                return None;
            }
            Err(_) => {
                warn!("speech generator timed out");
                let _ = std::fs::remove_file(&temp);
                return None;
            }
        };

        if !output.status.success() {
            let _ = std::fs::remove_file(&temp);
            return None;
        }

        if captures_stdout {
            if output.stdout.is_empty() {
                return None;
            }
            if let Err(error) = std::fs::write(&temp, &output.stdout) {
                warn!(%error, "failed to write generated artifact");
                return None;
            }
        } else if !temp.is_file() {
            return None;
        }

        inner.cache.commit(fingerprint, &temp).ok()
    }

    /// Claim the audio device and start the player. Returns at playback end
    /// for blocking speech, at playback start otherwise. Urgent playback
    /// kills the current process group first and may start before it is
    /// fully reaped.
    async fn play(
        &self,
        artifact: &Path,
        category: PlaybackCategory,
        blocking: bool,
        urgent: bool,
        session: Option<SessionId>,
    ) -> BrokerResult<PlayOutcome> {
        let inner = &self.inner;
        if urgent {
            inner.urgent_pending.fetch_add(1, Ordering::SeqCst);
            self.stop();
        }

        // Claim the playback slot. The start lock is held only to mutate the
        // slot, never across a spawn; urgent starters jump the line because
        // non-urgent ones back off while an urgent speak is pending.
        let mut epoch = inner.epoch.subscribe();
        let preempted = loop {
            let claimed = {
                let _guard = inner.start_lock.lock().await;
                let mut current = inner
                    .current
                    .lock()
                    .expect("playback slot lock poisoned");
                let may_start =
                    urgent || inner.urgent_pending.load(Ordering::SeqCst) == 0;
                if current.is_none() && may_start {
                    let preempted = Arc::new(AtomicBool::new(false));
                    *current = Some(Playback {
                        pid: None,
                        category,
                        preempted: Arc::clone(&preempted),
                    });
                    Some(preempted)
                } else {
                    None
                }
            };
            match claimed {
                Some(preempted) => break preempted,
                None => {
                    // An urgent starter kills whatever occupies the slot
                    // rather than queueing behind it.
                    if urgent {
                        self.stop();
                    }
                    let _ = epoch.changed().await;
                }
            }
        };

        // The spawn syscall runs with no lock held; a stop() that lands
        // mid-spawn marks the claim preempted and the kill is delivered as
        // soon as the pid is known.
        let done_rx = match self.spawn_player(artifact, urgent, session, preempted) {
            Ok(done_rx) => done_rx,
            Err(error) => {
                *inner
                    .current
                    .lock()
                    .expect("playback slot lock poisoned") = None;
                if urgent {
                    inner.urgent_pending.fetch_sub(1, Ordering::SeqCst);
                }
                inner.bump_epoch();
                self.note_playback_failure();
                return Err(error);
            }
        };

        if urgent || !blocking {
            return Ok(PlayOutcome::Started);
        }

        match done_rx.await {
            Ok(end) if end.preempted => {
                // A preempted blocking speak returns only once the urgent
                // speech that displaced it has finished.
                loop {
                    let settled = inner
                        .current
                        .lock()
                        .expect("playback slot lock poisoned")
                        .is_none()
                        && inner.urgent_pending.load(Ordering::SeqCst) == 0;
                    if settled {
                        break;
                    }
                    let _ = epoch.changed().await;
                }
                Ok(PlayOutcome::Preempted)
            }
            Ok(end) if end.success => Ok(PlayOutcome::Completed),
            Ok(_) => Ok(PlayOutcome::Failed),
            Err(_) => Err(BrokerError::Internal("playback joiner dropped".to_owned())),
        }
    }

    /// Spawn the player into its own process group and hand the child to a
    /// joiner task that reaps it, frees the slot, and feeds the recovery
    /// machine. Called after the slot has been claimed, with no lock held;
    /// the caller cleans up the claim on error.
    fn spawn_player(
        &self,
        artifact: &Path,
        urgent: bool,
        session: Option<SessionId>,
        preempted: Arc<AtomicBool>,
    ) -> BrokerResult<oneshot::Receiver<PlaybackEnd>> {
        let inner = &self.inner;
        let artifact_str = artifact.to_string_lossy().into_owned();
        let argv = substitute(
            &inner.config.player_command,
            &[("{artifact}", artifact_str.as_str())],
        );
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|error| BrokerError::Audio(format!("player spawn failed: {error}")))?;

        {
            let mut current = inner
                .current
                .lock()
                .expect("playback slot lock poisoned");
            if let Some(playback) = current.as_mut() {
                playback.pid = child.id();
            }
        }
        // A stop() that raced the spawn had nothing to kill yet; deliver the
        // deferred kill now that the process group exists.
        if preempted.load(Ordering::SeqCst) {
            if let Some(pid) = child.id() {
                kill_process_group(pid);
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        let engine = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let success = status.map(|status| status.success()).unwrap_or(false);
            let was_preempted = preempted.load(Ordering::SeqCst);
            *engine
                .inner
                .current
                .lock()
                .expect("playback slot lock poisoned") = None;
            if urgent {
                engine.inner.urgent_pending.fetch_sub(1, Ordering::SeqCst);
            }
            engine.inner.bump_epoch();
            engine.on_player_exit(success, was_preempted);
            if !success && !was_preempted {
                if let Some(session_id) = session {
                    engine.publish_speech_failed(&session_id, "audio playback failed");
                }
            }
            let _ = done_tx.send(PlaybackEnd {
                success,
                preempted: was_preempted,
            });
        });
        Ok(done_rx)
    }

    fn on_player_exit(&self, success: bool, preempted: bool) {
        // Kills from preemption are not device failures.
        if preempted {
            return;
        }
        if success {
            let should_emit = self
                .inner
                .recovery
                .lock()
                .expect("recovery tracker lock poisoned")
                .record_success();
            if should_emit {
                self.inner.bus.publish(None, BrokerEvent::PulseRecovered);
            }
        } else {
            self.note_playback_failure();
        }
    }

    fn note_playback_failure(&self) {
        let directive = self
            .inner
            .recovery
            .lock()
            .expect("recovery tracker lock poisoned")
            .record_failure(Instant::now());
        if directive.emit_pulse_down {
            warn!("audio playback failing; device degraded");
            self.inner.bus.publish(None, BrokerEvent::PulseDown);
        }
        if let Some(attempt) = directive.attempt {
            self.spawn_recovery_attempt(attempt);
        }
    }

    fn spawn_recovery_attempt(&self, attempt: u32) {
        let engine = self.clone();
        tokio::spawn(async move {
            let (backoff, command) = {
                let recovery = engine
                    .inner
                    .recovery
                    .lock()
                    .expect("recovery tracker lock poisoned");
                let policy = recovery.policy();
                (
                    policy.backoff_for(attempt),
                    policy.command_for(attempt).map(<[String]>::to_vec),
                )
            };
            tokio::time::sleep(backoff).await;
            let Some(argv) = command else {
                return;
            };
            debug!(attempt, command = ?argv, "running audio recovery command");
            let mut recover = Command::new(&argv[0]);
            recover
                .args(&argv[1..])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            match recover.status().await {
                Ok(status) if status.success() => debug!(attempt, "recovery command succeeded"),
                Ok(status) => warn!(attempt, ?status, "recovery command failed"),
                Err(error) => warn!(attempt, %error, "recovery command did not start"),
            }
        });
    }

    fn publish_speech_failed(&self, session_id: &SessionId, reason: &str) {
        self.inner.bus.publish(
            Some(session_id.clone()),
            BrokerEvent::SpeechFailed {
                reason: reason.to_owned(),
            },
        );
    }
}

#[async_trait]
impl SpeechSink for SpeechEngine {
    async fn speak(&self, request: SpeechRequest) -> BrokerResult<SpeechOutcome> {
        if !request.urgent && self.health() == AudioHealth::Down {
            self.publish_speech_failed(&request.session_id, "audio device down; speech dropped");
            return Ok(SpeechOutcome::Dropped);
        }

        let Some(artifact) = self.resolve_artifact(&request.text, &request.voice).await else {
            self.publish_speech_failed(&request.session_id, "speech generation failed");
            return Ok(SpeechOutcome::Dropped);
        };

        match self
            .play(
                &artifact,
                PlaybackCategory::Agent,
                request.blocking,
                request.urgent,
                Some(request.session_id.clone()),
            )
            .await
        {
            Ok(PlayOutcome::Completed) | Ok(PlayOutcome::Preempted) => Ok(SpeechOutcome::Completed),
            Ok(PlayOutcome::Started) => Ok(SpeechOutcome::Started),
            Ok(PlayOutcome::Failed) => Ok(SpeechOutcome::Dropped),
            Err(error) => {
                warn!(session = %request.session_id, %error, "speech playback failed");
                self.publish_speech_failed(&request.session_id, "audio playback failed");
                Ok(SpeechOutcome::Dropped)
            }
        }
    }

    fn begin_readout(&self) -> u64 {
        self.inner.readout_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn readout(&self, text: String, voice: VoiceProfile, token: u64) {
        let stale = || self.inner.readout_generation.load(Ordering::SeqCst) != token;
        if stale() {
            return;
        }
        let Some(artifact) = self.resolve_artifact(&text, &voice).await else {
            return;
        };
        if stale() {
            return;
        }

        // Interrupt a prior readout, never agent speech.
        {
            let current = self
                .inner
                .current
                .lock()
                .expect("playback slot lock poisoned");
            match current.as_ref() {
                Some(playback) if playback.category == PlaybackCategory::Agent => return,
                Some(playback) => {
                    playback.preempted.store(true, Ordering::SeqCst);
                    if let Some(pid) = playback.pid {
                        kill_process_group(pid);
                    }
                }
                None => {}
            }
        }
        if stale() {
            return;
        }
        let _ = self
            .play(&artifact, PlaybackCategory::Readout, false, false, None)
            .await;
    }

    async fn pregenerate(&self, texts: Vec<String>, voice: VoiceProfile) {
        use futures::StreamExt;
        let concurrency = self.inner.config.pregenerate_concurrency.max(1);
        futures::stream::iter(texts)
            .for_each_concurrent(concurrency, |text| {
                let engine = self.clone();
                let voice = voice.clone();
                async move {
                    let _ = engine.resolve_artifact(&text, &voice).await;
                }
            })
            .await;
    }

    fn stop(&self) {
        // Kill is a syscall that can block on hostile schedulers; never hold
        // the start lock around it. The joiner clears the slot on exit.
        let target = {
            let current = self
                .inner
                .current
                .lock()
                .expect("playback slot lock poisoned");
            current.as_ref().map(|playback| {
                playback.preempted.store(true, Ordering::SeqCst);
                playback.pid
            })
        };
        if let Some(Some(pid)) = target {
            kill_process_group(pid);
        }
    }
}

fn substitute(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            let mut out = arg.clone();
            for (name, value) in vars {
                out = out.replace(name, value);
            }
            out
        })
        .collect()
}

/// The player runs in its own process group (pgid == pid), so the kill
/// reaches wrapper scripts and their descendants.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}
