//! Control-side engine
//!
//! [`AudioEngine`] is driven from one control thread. It owns the backend,
//! the parameter publisher and the lifecycle state machine; the audio
//! threads only ever see the [`SharedState`] flag, the parameter bus and the
//! queues created for each stream.
//!
//! ```text
//!  control thread                         audio threads
//!  ──────────────                         ─────────────
//!  start/stop/suspend ──► SharedState ──────► callbacks (silence when !Running)
//!  publish_profile    ──► ParameterBus ─────► Processor
//!  poll()             ◄── TelemetryReceiver ◄─ Processor
//!        │            ◄── DeviceStatus ◄────── platform error callback
//!        ▼
//!  EventBus ──► subscribers
//! ```
//!
//! Device loss is handled in [`AudioEngine::poll`]: a transient fault
//! suspends the engine and schedules reacquisition with exponential backoff,
//! a fatal one (or running out of attempts) moves it to `Failed`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, TrySendError};

use crate::audio::{
    AudioBackend, AudioError, AudioResult, DeviceFault, DeviceStatus, NegotiatedConfig, StreamHandle,
    MIN_QUEUE_DEPTH,
};
use crate::config::HearampConfig;
use crate::engine::callback::StreamCallbacks;
use crate::engine::gc::gc_handle;
use crate::engine::parameter_bus::{parameter_bus, ParameterPublisher, ParameterSnapshot, MASTER_GAIN_RANGE_DB};
use crate::engine::processor::Processor;
use crate::engine::state::{EngineError, EngineState, SharedState};
use crate::engine::telemetry::{
    telemetry_channel, EngineTelemetry, TelemetryEvent, TelemetryReceiver, TelemetrySnapshot,
};
use crate::profile::{AudiogramProfile, ProfileError};

/// Telemetry events the audio thread may queue between two polls
const TELEMETRY_CAPACITY: usize = 256;

/// How long stop/suspend wait for the callback to go silent
const QUIESCE_TIMEOUT: Duration = Duration::from_millis(100);

/// Something subscribers should know about
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged { from: EngineState, to: EngineState },
    /// Forwarded from the audio thread
    Telemetry(TelemetryEvent),
    /// Device or stream failure; `transient` faults are retried
    Error { message: String, transient: bool },
    /// Next reacquisition attempt is scheduled
    Reconnecting { attempt: u32, delay_ms: u64 },
    StreamOpened {
        sample_rate: u32,
        frame_size: usize,
        estimated_latency_ms: f32,
    },
}

/// Bounded event channel shared by all subscribers
///
/// Publishing never blocks the control thread: when the queue is full the
/// event is dropped and counted.
pub struct EventBus {
    sender: Sender<EngineEvent>,
    receiver: Receiver<EngineEvent>,
    dropped: u64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam::channel::bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            dropped: 0,
        }
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.receiver.clone()
    }

    pub fn publish(&mut self, event: EngineEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped += 1;
                log::debug!("Event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Events lost to a full queue
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// An open stream and the control end of its telemetry queue
struct OpenStream<S> {
    handle: S,
    telemetry: TelemetryReceiver,
}

/// Pending device reacquisition
#[derive(Debug, Clone, Copy)]
struct Reconnect {
    attempt: u32,
    due: Instant,
}

/// The hearing-amplification engine
pub struct AudioEngine<B: AudioBackend> {
    backend: B,
    config: HearampConfig,
    shared: Arc<SharedState>,
    telemetry: Arc<EngineTelemetry>,
    publisher: ParameterPublisher,
    status: Arc<DeviceStatus>,
    events: EventBus,
    stream: Option<OpenStream<B::Stream>>,
    negotiated: Option<NegotiatedConfig>,
    reconnect: Option<Reconnect>,
}

impl<B: AudioBackend> AudioEngine<B> {
    /// Create a stopped engine
    ///
    /// Fails if the configured profile or master gain is invalid, or the
    /// parameter collector thread cannot be started.
    pub fn new(backend: B, config: HearampConfig) -> Result<Self, EngineError> {
        config.profile.validate()?;
        let (min, max) = MASTER_GAIN_RANGE_DB;
        if !config.master_gain_db.is_finite() || !(min..=max).contains(&config.master_gain_db) {
            return Err(ProfileError::ProfileValue {
                field: "master_gain_db",
                value: config.master_gain_db,
            }
            .into());
        }

        let gc = gc_handle()?;
        let (publisher, _) = parameter_bus(&gc, config.initial_parameters());

        log::info!(
            "Audio engine created: profile '{}' with {} bands",
            config.profile.name,
            config.profile.band_count()
        );
        Ok(Self {
            backend,
            config,
            shared: Arc::new(SharedState::new()),
            telemetry: Arc::new(EngineTelemetry::new()),
            publisher,
            status: Arc::new(DeviceStatus::new()),
            events: EventBus::default(),
            stream: None,
            negotiated: None,
            reconnect: None,
        })
    }

    pub fn state(&self) -> EngineState {
        self.shared.load()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// What the platform granted for the current (or last) stream
    pub fn negotiated(&self) -> Option<&NegotiatedConfig> {
        self.negotiated.as_ref()
    }

    /// Parameters most recently published to the audio thread
    pub fn parameters(&self) -> &ParameterSnapshot {
        self.publisher.current()
    }

    /// Configuration including every accepted runtime change
    pub fn config(&self) -> &HearampConfig {
        &self.config
    }

    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Open the devices and start processing
    ///
    /// Any failure leaves the engine in `Failed`.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.transition(EngineState::Starting)?;
        if let Err(e) = self.open_stream() {
            log::error!("Failed to start audio engine: {}", e);
            self.enter_failed(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Silence the output and close the devices
    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.reconnect = None;
        if self.state() == EngineState::Failed {
            self.close_stream();
            return self.transition(EngineState::Stopped);
        }
        self.transition(EngineState::Stopping)?;
        self.close_stream();
        self.transition(EngineState::Stopped)
    }

    /// Release the devices but keep the session (no automatic retry)
    pub fn suspend(&mut self) -> Result<(), EngineError> {
        self.transition(EngineState::Suspended)?;
        self.reconnect = None;
        self.close_stream();
        Ok(())
    }

    /// Reacquire the devices after a suspend
    ///
    /// A transient failure keeps the engine suspended and schedules retries;
    /// any other failure moves it to `Failed`.
    pub fn resume(&mut self) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Suspended {
            return Err(EngineError::InvalidTransition {
                from: state,
                to: EngineState::Running,
            });
        }
        self.reconnect = None;
        match self.open_stream() {
            Ok(()) => Ok(()),
            Err(e) if is_transient(&e) => {
                log::warn!("Resume failed, will retry: {}", e);
                self.schedule_reconnect(1, e.to_string());
                Err(e)
            }
            Err(e) => {
                log::error!("Resume failed: {}", e);
                self.enter_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Leave `Failed` (or `Stopped`) and start again
    pub fn restart(&mut self) -> Result<(), EngineError> {
        if self.state() == EngineState::Failed {
            self.transition(EngineState::Stopped)?;
        }
        self.start()
    }

    /// Service the engine from the control thread
    ///
    /// Forwards queued telemetry to subscribers, reacts to device faults and
    /// runs due reconnection attempts. Returns the number of telemetry events
    /// forwarded. Call it every few tens of milliseconds.
    pub fn poll(&mut self) -> usize {
        let forwarded = match self.stream.as_mut() {
            Some(stream) => forward_telemetry(&mut stream.telemetry, &mut self.events),
            None => 0,
        };

        if let Some(fault) = self.status.take() {
            self.handle_fault(fault);
        }
        self.run_due_reconnect();
        forwarded
    }

    /// Validate and publish a new fitting
    ///
    /// While a stream is open the band count is fixed to the running one.
    pub fn publish_profile(&mut self, profile: &AudiogramProfile) -> Result<u64, EngineError> {
        let generation = self.publisher.publish_profile(profile)?;
        self.config.profile = profile.clone();
        log::info!("Published profile '{}' (generation {})", profile.name, generation);
        Ok(generation)
    }

    pub fn set_master_gain_db(&mut self, gain_db: f32) -> Result<u64, EngineError> {
        let generation = self.publisher.set_master_gain_db(gain_db)?;
        self.config.master_gain_db = gain_db;
        Ok(generation)
    }

    pub fn set_muted(&mut self, muted: bool) -> u64 {
        self.publisher.set_muted(muted)
    }

    pub fn set_feedback_enabled(&mut self, enabled: bool) -> u64 {
        self.config.feedback.enabled = enabled;
        self.publisher.set_feedback_enabled(enabled)
    }

    fn transition(&mut self, to: EngineState) -> Result<(), EngineError> {
        let from = self.shared.transition(to)?;
        log::info!("Engine state: {} -> {}", from, to);
        self.events.publish(EngineEvent::StateChanged { from, to });
        Ok(())
    }

    /// Negotiate, build the processor and callbacks, play, enter `Running`
    fn open_stream(&mut self) -> Result<(), EngineError> {
        let mut negotiated = self.backend.negotiate(&self.config.audio)?;
        self.config.profile.validate_for_rate(negotiated.sample_rate)?;

        let settings = self
            .config
            .processor_settings(negotiated.sample_rate, negotiated.frame_size);
        let lookahead = settings.limiter.lookahead_samples(negotiated.sample_rate);
        let estimated_latency_ms =
            fit_latency_budget(&mut negotiated, lookahead, self.config.audio.latency_budget_ms)?;

        self.publisher.set_sample_rate(negotiated.sample_rate);
        let (events_tx, events_rx) = telemetry_channel(TELEMETRY_CAPACITY, Arc::clone(&self.telemetry));
        let processor = Processor::new(&settings, self.publisher.reader(), events_tx);
        self.publisher.lock_band_count(Some(processor.band_count()));

        let callbacks = StreamCallbacks::new(
            &negotiated,
            processor,
            Arc::clone(&self.shared),
            Arc::clone(&self.telemetry),
        );
        self.status.clear();
        let handle = self
            .backend
            .open(&negotiated, callbacks, Arc::clone(&self.status))
            .inspect_err(|_| self.publisher.lock_band_count(None))?;
        // Callbacks answer with silence until the state flips to Running
        if let Err(e) = handle.play() {
            self.publisher.lock_band_count(None);
            return Err(e.into());
        }

        log::info!(
            "Stream open: {}Hz, {} samples/frame, queue depth {}, ~{:.1}ms latency",
            negotiated.sample_rate,
            negotiated.frame_size,
            negotiated.queue_depth,
            estimated_latency_ms
        );
        self.events.publish(EngineEvent::StreamOpened {
            sample_rate: negotiated.sample_rate,
            frame_size: negotiated.frame_size,
            estimated_latency_ms,
        });
        self.stream = Some(OpenStream {
            handle,
            telemetry: events_rx,
        });
        self.negotiated = Some(negotiated);
        self.transition(EngineState::Running)
    }

    /// Wait for the callbacks to go silent, then drop the streams
    ///
    /// The state must already have left `Running`.
    fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if !self.shared.wait_quiesced(QUIESCE_TIMEOUT) {
                log::warn!("Audio callback did not acknowledge stop within {:?}", QUIESCE_TIMEOUT);
            }
            if let Err(e) = stream.handle.pause() {
                log::debug!("Failed to pause streams: {}", e);
            }
            forward_telemetry(&mut stream.telemetry, &mut self.events);
            log::info!("Audio streams closed");
        }
        self.publisher.lock_band_count(None);
    }

    fn handle_fault(&mut self, fault: DeviceFault) {
        let state = self.state();
        match fault {
            DeviceFault::Transient if state == EngineState::Running => {
                log::warn!("Audio device lost, suspending");
                if self.transition(EngineState::Suspended).is_ok() {
                    self.close_stream();
                    self.schedule_reconnect(1, "audio device unavailable".to_string());
                }
            }
            DeviceFault::Fatal if matches!(state, EngineState::Running | EngineState::Suspended) => {
                log::error!("Fatal audio device error");
                self.enter_failed("fatal audio stream error".to_string());
            }
            _ => log::debug!("Ignoring {:?} fault in state {}", fault, state),
        }
    }

    fn schedule_reconnect(&mut self, attempt: u32, message: String) {
        let delay = self.config.audio.reconnect.delay_for(attempt);
        self.reconnect = Some(Reconnect {
            attempt,
            due: Instant::now() + delay,
        });
        self.events.publish(EngineEvent::Error {
            message,
            transient: true,
        });
        self.events.publish(EngineEvent::Reconnecting {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
    }

    fn run_due_reconnect(&mut self) {
        let Some(reconnect) = self.reconnect else {
            return;
        };
        if self.state() != EngineState::Suspended {
            self.reconnect = None;
            return;
        }
        if Instant::now() < reconnect.due {
            return;
        }

        log::info!("Reacquiring audio devices (attempt {})", reconnect.attempt);
        self.reconnect = None;
        match self.open_stream() {
            Ok(()) => log::info!("Audio devices reacquired after {} attempt(s)", reconnect.attempt),
            Err(e) if is_transient(&e) && !self.config.audio.reconnect.exhausted(reconnect.attempt) => {
                log::warn!("Reacquire attempt {} failed: {}", reconnect.attempt, e);
                self.schedule_reconnect(reconnect.attempt + 1, e.to_string());
            }
            Err(e) => {
                log::error!("Giving up on audio devices after {} attempt(s): {}", reconnect.attempt, e);
                self.enter_failed(e.to_string());
            }
        }
    }

    fn enter_failed(&mut self, message: String) {
        self.reconnect = None;
        if let Err(e) = self.transition(EngineState::Failed) {
            log::debug!("Not entering failed state: {}", e);
        }
        self.close_stream();
        self.events.publish(EngineEvent::Error {
            message,
            transient: false,
        });
    }
}

impl<B: AudioBackend> Drop for AudioEngine<B> {
    fn drop(&mut self) {
        if self.stream.is_some() {
            if let Err(e) = self.stop() {
                log::debug!("Stop on drop failed: {}", e);
                self.close_stream();
            }
        }
    }
}

fn is_transient(error: &EngineError) -> bool {
    matches!(error, EngineError::Audio(e) if e.is_transient())
}

fn forward_telemetry(receiver: &mut TelemetryReceiver, events: &mut EventBus) -> usize {
    let mut forwarded = 0;
    for event in receiver.drain() {
        events.publish(EngineEvent::Telemetry(event));
        forwarded += 1;
    }
    forwarded
}

/// Make the negotiated stream fit the latency budget
///
/// Over budget, the queue depth drops to [`MIN_QUEUE_DEPTH`]; if that is not
/// enough the stream is rejected. Returns the final estimate in ms.
fn fit_latency_budget(negotiated: &mut NegotiatedConfig, lookahead: usize, budget_ms: f32) -> AudioResult<f32> {
    let estimated_ms = negotiated.estimated_latency_ms(lookahead);
    if estimated_ms <= budget_ms {
        return Ok(estimated_ms);
    }

    if negotiated.queue_depth > MIN_QUEUE_DEPTH {
        let reduced = NegotiatedConfig {
            queue_depth: MIN_QUEUE_DEPTH,
            ..negotiated.clone()
        };
        let reduced_ms = reduced.estimated_latency_ms(lookahead);
        log::warn!(
            "Estimated latency {:.1}ms exceeds budget of {:.1}ms, reducing queue depth {} -> {} ({:.1}ms)",
            estimated_ms,
            budget_ms,
            negotiated.queue_depth,
            MIN_QUEUE_DEPTH,
            reduced_ms
        );
        if reduced_ms <= budget_ms {
            *negotiated = reduced;
            return Ok(reduced_ms);
        }
        return Err(AudioError::LatencyBudget {
            estimated_ms: reduced_ms,
            budget_ms,
        });
    }

    Err(AudioError::LatencyBudget {
        estimated_ms,
        budget_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ReconnectPolicy, StreamConfig};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ManualInner {
        negotiate_errors: VecDeque<AudioError>,
        callbacks: Option<StreamCallbacks>,
        status: Option<Arc<DeviceStatus>>,
        opened: usize,
        playing: bool,
    }

    /// Backend whose callbacks are driven by the test itself
    #[derive(Clone, Default)]
    struct ManualBackend {
        inner: Arc<Mutex<ManualInner>>,
    }

    impl ManualBackend {
        fn fail_next_negotiations(&self, errors: impl IntoIterator<Item = AudioError>) {
            self.inner.lock().unwrap().negotiate_errors.extend(errors);
        }

        fn report(&self, fault: DeviceFault) {
            let inner = self.inner.lock().unwrap();
            inner.status.as_ref().unwrap().report(fault);
        }

        fn opened(&self) -> usize {
            self.inner.lock().unwrap().opened
        }

        /// One mono capture period and one stereo render period
        fn run_period(&self, input: &[f32]) -> Vec<f32> {
            let mut inner = self.inner.lock().unwrap();
            let callbacks = inner.callbacks.as_mut().unwrap();
            let mut output = vec![0.0; input.len() * 2];
            callbacks.capture.on_input(input, 1, None);
            callbacks.render.on_output(&mut output, 2, None);
            output
        }
    }

    struct ManualStream {
        inner: Arc<Mutex<ManualInner>>,
    }

    impl StreamHandle for ManualStream {
        fn play(&self) -> AudioResult<()> {
            self.inner.lock().unwrap().playing = true;
            Ok(())
        }

        fn pause(&self) -> AudioResult<()> {
            self.inner.lock().unwrap().playing = false;
            Ok(())
        }
    }

    impl Drop for ManualStream {
        fn drop(&mut self) {
            if let Ok(mut inner) = self.inner.lock() {
                inner.callbacks = None;
            }
        }
    }

    impl AudioBackend for ManualBackend {
        type Stream = ManualStream;

        fn negotiate(&mut self, config: &StreamConfig) -> AudioResult<NegotiatedConfig> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(err) = inner.negotiate_errors.pop_front() {
                return Err(err);
            }
            Ok(NegotiatedConfig {
                sample_rate: config.sample_rate,
                frame_size: config.effective_frame_size(),
                input_channels: 1,
                output_channels: 2,
                input_buffer_frames: Some(64),
                output_buffer_frames: Some(64),
                queue_depth: config.queue_depth,
                input_device: "test mic".to_string(),
                output_device: "test earpiece".to_string(),
            })
        }

        fn open(
            &mut self,
            _negotiated: &NegotiatedConfig,
            callbacks: StreamCallbacks,
            status: Arc<DeviceStatus>,
        ) -> AudioResult<ManualStream> {
            let mut inner = self.inner.lock().unwrap();
            inner.callbacks = Some(callbacks);
            inner.status = Some(status);
            inner.opened += 1;
            Ok(ManualStream {
                inner: Arc::clone(&self.inner),
            })
        }
    }

    fn test_config() -> HearampConfig {
        let mut config = HearampConfig::default();
        config.audio.frame_size = 64;
        config.audio.queue_depth = 4;
        config.audio.latency_budget_ms = 20.0;
        config.audio.reconnect = ReconnectPolicy {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: Some(3),
        };
        config
    }

    fn state_changes(events: &Receiver<EngineEvent>) -> Vec<(EngineState, EngineState)> {
        events
            .try_iter()
            .filter_map(|event| match event {
                EngineEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_stop_lifecycle() {
        use EngineState::*;
        let backend = ManualBackend::default();
        let mut engine = AudioEngine::new(backend.clone(), test_config()).unwrap();
        let events = engine.subscribe();

        engine.start().unwrap();
        assert_eq!(engine.state(), Running);
        assert!(backend.inner.lock().unwrap().playing);

        let input = vec![0.05_f32; 64];
        for _ in 0..10 {
            let output = backend.run_period(&input);
            assert!(output.iter().all(|s| s.is_finite()));
        }
        engine.poll();
        assert_eq!(engine.telemetry().frames_processed, 10);

        engine.stop().unwrap();
        assert_eq!(engine.state(), Stopped);
        assert!(backend.inner.lock().unwrap().callbacks.is_none());
        assert_eq!(
            state_changes(&events),
            vec![(Stopped, Starting), (Starting, Running), (Running, Stopping), (Stopping, Stopped)]
        );
    }

    #[test]
    fn test_illegal_requests_are_rejected() {
        let mut engine = AudioEngine::new(ManualBackend::default(), test_config()).unwrap();
        assert!(matches!(
            engine.resume(),
            Err(EngineError::InvalidTransition {
                from: EngineState::Stopped,
                to: EngineState::Running
            })
        ));
        assert!(matches!(engine.stop(), Err(EngineError::InvalidTransition { .. })));
        assert!(matches!(engine.suspend(), Err(EngineError::InvalidTransition { .. })));

        engine.start().unwrap();
        assert!(matches!(
            engine.start(),
            Err(EngineError::InvalidTransition {
                from: EngineState::Running,
                to: EngineState::Starting
            })
        ));
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let mut config = test_config();
        config.profile.left[0].ratio = 0.5;
        assert!(matches!(
            AudioEngine::new(ManualBackend::default(), config),
            Err(EngineError::Profile(_))
        ));

        let mut config = test_config();
        config.master_gain_db = 40.0;
        assert!(AudioEngine::new(ManualBackend::default(), config).is_err());
    }

    #[test]
    fn test_manual_suspend_and_resume() {
        let backend = ManualBackend::default();
        let mut engine = AudioEngine::new(backend.clone(), test_config()).unwrap();
        engine.start().unwrap();

        engine.suspend().unwrap();
        assert_eq!(engine.state(), EngineState::Suspended);
        engine.poll();
        // No automatic retry after an explicit suspend
        assert_eq!(engine.state(), EngineState::Suspended);
        assert_eq!(backend.opened(), 1);

        engine.resume().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(backend.opened(), 2);
    }

    #[test]
    fn test_transient_loss_reconnects() {
        let backend = ManualBackend::default();
        let mut engine = AudioEngine::new(backend.clone(), test_config()).unwrap();
        let events = engine.subscribe();
        engine.start().unwrap();

        backend.fail_next_negotiations([AudioError::DeviceUnavailable("unplugged".to_string())]);
        backend.report(DeviceFault::Transient);

        // Fault handled, first attempt fails, second one is scheduled
        engine.poll();
        assert_eq!(engine.state(), EngineState::Suspended);
        engine.poll();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(backend.opened(), 2);

        let attempts: Vec<u32> = events
            .try_iter()
            .filter_map(|event| match event {
                EngineEvent::Reconnecting { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2]);

        // Audio flows again on the new stream
        backend.run_period(&[0.0; 64]);
        engine.poll();
        assert!(engine.telemetry().frames_processed >= 1);
    }

    #[test]
    fn test_exhausted_retries_fail_until_restart() {
        let backend = ManualBackend::default();
        let mut engine = AudioEngine::new(backend.clone(), test_config()).unwrap();
        engine.start().unwrap();

        backend.fail_next_negotiations((0..3).map(|_| AudioError::DeviceUnavailable("gone".to_string())));
        backend.report(DeviceFault::Transient);
        for _ in 0..3 {
            engine.poll();
        }
        assert_eq!(engine.state(), EngineState::Failed);
        assert_eq!(backend.opened(), 1);

        assert!(matches!(engine.start(), Err(EngineError::InvalidTransition { .. })));
        engine.restart().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(backend.opened(), 2);
    }

    #[test]
    fn test_fatal_fault_fails_engine() {
        let backend = ManualBackend::default();
        let mut engine = AudioEngine::new(backend.clone(), test_config()).unwrap();
        let events = engine.subscribe();
        engine.start().unwrap();

        backend.report(DeviceFault::Fatal);
        engine.poll();
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(events.try_iter().any(|event| matches!(
            event,
            EngineEvent::Error {
                transient: false,
                ..
            }
        )));

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_start_failure_enters_failed() {
        let backend = ManualBackend::default();
        let mut engine = AudioEngine::new(backend.clone(), test_config()).unwrap();
        backend.fail_next_negotiations([AudioError::UnsupportedFormat("i16 only".to_string())]);

        assert!(matches!(engine.start(), Err(EngineError::Audio(AudioError::UnsupportedFormat(_)))));
        assert_eq!(engine.state(), EngineState::Failed);
        engine.restart().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn test_band_count_locked_while_running() {
        let mut engine = AudioEngine::new(ManualBackend::default(), test_config()).unwrap();
        let two_bands = AudiogramProfile::transparent(vec![1000.0]);

        engine.start().unwrap();
        assert!(matches!(
            engine.publish_profile(&two_bands),
            Err(EngineError::Profile(ProfileError::BandCountMismatch {
                expected: 4,
                actual: 2
            }))
        ));
        let mut louder = AudiogramProfile::default();
        louder.left[1].gain_db = 15.0;
        assert_eq!(engine.publish_profile(&louder).unwrap(), 1);

        engine.stop().unwrap();
        assert_eq!(engine.publish_profile(&two_bands).unwrap(), 2);
        assert_eq!(engine.parameters().profile.band_count, 2);
    }

    #[test]
    fn test_parameter_changes_reach_audio_thread() {
        let backend = ManualBackend::default();
        let mut engine = AudioEngine::new(backend.clone(), test_config()).unwrap();
        let events = engine.subscribe();
        engine.start().unwrap();

        let generation = engine.set_master_gain_db(-6.0).unwrap();
        assert!(engine.set_master_gain_db(f32::NAN).is_err());
        backend.run_period(&[0.0; 64]);
        assert!(engine.poll() >= 1);
        assert!(events
            .try_iter()
            .any(|event| event == EngineEvent::Telemetry(TelemetryEvent::ParametersApplied { generation })));
        assert_eq!(engine.config().master_gain_db, -6.0);
    }

    #[test]
    fn test_latency_budget_reduces_queue_depth() {
        // 64 + 4·64 + 64 + 72 + 64 = 520 samples (10.8 ms), at depth 2: 392 (8.2 ms)
        let mut config = test_config();
        config.audio.latency_budget_ms = 9.0;
        let mut engine = AudioEngine::new(ManualBackend::default(), config).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.negotiated().unwrap().queue_depth, MIN_QUEUE_DEPTH);

        let mut config = test_config();
        config.audio.latency_budget_ms = 5.0;
        let mut engine = AudioEngine::new(ManualBackend::default(), config).unwrap();
        assert!(matches!(
            engine.start(),
            Err(EngineError::Audio(AudioError::LatencyBudget { .. }))
        ));
        assert_eq!(engine.state(), EngineState::Failed);
    }
}
