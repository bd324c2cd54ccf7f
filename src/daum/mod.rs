//! Daum ergometer session.
//!
//! One task owns the serial channel and every piece of shared protocol
//! state: the cockpit address, the command queue, the last known telemetry
//! and the session mode. Three recurring timers (queue tick, run data poll,
//! address retry) and the incoming window stream are serialized onto a
//! single `select!` loop, so no locking is needed anywhere.
//!
//! Downstream consumers, the wireless fitness profile and the local UI,
//! talk to the session through a cloneable [`SessionHandle`]: setters and
//! control requests go in over a channel, telemetry samples and structured
//! events come back out over broadcast channels.

pub mod command;
pub mod frame;
pub mod port;
pub mod queue;
pub mod simulation;
pub mod telemetry;

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use self::command::{get_address_frame, Command, Opcode, Priority};
use self::queue::CommandQueue;
use self::simulation::SimulationParameters;
use self::telemetry::{LastValues, RunDataSample};

/// The cockpit's one byte bus address, learned once per session through the
/// handshake and compared numerically everywhere.
pub type BusAddress = u8;

/// Which component is authoritative for the next power target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionMode {
    /// Remote application dictates target power; held even at zero cadence.
    Erg,
    /// Target power is derived locally from road physics.
    Sim,
}

/// What the shift buttons currently drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftTarget {
    Gear,
    Power,
}

/// A single or fast (multi step) shift in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftStep {
    Up,
    Down,
    UpFast,
    DownFast,
}

impl ShiftStep {
    fn steps(self, fast: u8) -> i16 {
        match self {
            ShiftStep::Up => 1,
            ShiftStep::Down => -1,
            ShiftStep::UpFast => fast as i16,
            ShiftStep::DownFast => -(fast as i16),
        }
    }
}

/// Watt profile adjustment, one device step up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WattProfile {
    Increment,
    Decrement,
}

impl WattProfile {
    fn payload(self) -> u8 {
        match self {
            WattProfile::Increment => 0,
            WattProfile::Decrement => 1,
        }
    }
}

/// Control point requests from the fitness profile collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlRequest {
    /// The remote application takes control of the trainer.
    Control,
    /// Full session restart.
    Reset,
    /// ERG mode power target in watts.
    SetPower(f64),
    /// SIM mode physics parameters.
    SetSimulation(SimulationParameters),
}

/// Structured events for UI and log consumption. Nothing in the engine
/// escalates past these; recoverable trouble is reported, never thrown.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PortOpened { path: String },
    AddressResolved { address: BusAddress },
    ControlGranted,
    CommandRefused { opcode: Opcode },
    CommandDropped { opcode: Opcode },
    QueueOverflow { opcode: Opcode },
    GearLimited { reported: u8, limit: u8 },
    InvalidRunData,
    UnrecognizedResponse { bytes: Vec<u8> },
    Restarting { reason: String },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Opening,
    Resolving,
    Running,
    Error,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is no longer running")]
    Closed,
    #[error("invalid value: {0}")]
    Invalid(&'static str),
}

/// Address resolution state. Everything except the handshake itself is
/// gated on `Resolved`, and the address is immutable until a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressState {
    Unresolved,
    Resolved(BusAddress),
}

impl AddressState {
    fn is_resolved(&self) -> bool {
        matches!(self, AddressState::Resolved(_))
    }
}

/// Why the drive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Close and reopen the channel, re-resolve the address.
    Restart,
    /// Session is shutting down for good.
    Shutdown,
}

/// Requests from handles into the session task.
#[derive(Debug)]
enum Request {
    SetPower(f64),
    SetGear(u8),
    SetProgram(u8),
    SetWattProfile(WattProfile),
    Shift(ShiftStep),
    ShiftGear(ShiftStep),
    ShiftPower(ShiftStep),
    SetMode(SessionMode),
    SetShiftTarget(ShiftTarget),
    SetSimulation(SimulationParameters),
    GetPersonData,
    Control,
    Restart,
}

/// Cloneable handle to a running [`ErgoSession`].
#[derive(Clone)]
pub struct SessionHandle {
    request_tx: mpsc::Sender<Request>,
    sample_tx: broadcast::Sender<RunDataSample>,
    event_tx: broadcast::Sender<SessionEvent>,
    status_rx: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Target power in watts; clamped and rounded to the device's step.
    pub async fn set_power(&self, watts: f64) -> Result<(), SessionError> {
        if !watts.is_finite() {
            return Err(SessionError::Invalid("power must be finite"));
        }
        self.send(Request::SetPower(watts)).await
    }

    pub async fn set_gear(&self, gear: u8) -> Result<(), SessionError> {
        self.send(Request::SetGear(gear)).await
    }

    pub async fn set_program(&self, program: u8) -> Result<(), SessionError> {
        self.send(Request::SetProgram(program)).await
    }

    /// Nudge the cockpit's watt target one device step up or down.
    pub async fn set_watt_profile(&self, profile: WattProfile) -> Result<(), SessionError> {
        self.send(Request::SetWattProfile(profile)).await
    }

    /// Shift whatever the configured shift target is, gear or power.
    pub async fn shift(&self, step: ShiftStep) -> Result<(), SessionError> {
        self.send(Request::Shift(step)).await
    }

    pub async fn shift_gear(&self, step: ShiftStep) -> Result<(), SessionError> {
        self.send(Request::ShiftGear(step)).await
    }

    pub async fn shift_power(&self, step: ShiftStep) -> Result<(), SessionError> {
        self.send(Request::ShiftPower(step)).await
    }

    /// Mode switches apply immediately; they are not queued.
    pub async fn set_mode(&self, mode: SessionMode) -> Result<(), SessionError> {
        self.send(Request::SetMode(mode)).await
    }

    pub async fn set_shift_target(&self, target: ShiftTarget) -> Result<(), SessionError> {
        self.send(Request::SetShiftTarget(target)).await
    }

    pub async fn set_simulation(
        &self,
        params: SimulationParameters,
    ) -> Result<(), SessionError> {
        if ![params.wind_speed, params.grade, params.crr, params.cd]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(SessionError::Invalid("simulation parameters must be finite"));
        }
        self.send(Request::SetSimulation(params)).await
    }

    pub async fn get_person_data(&self) -> Result<(), SessionError> {
        self.send(Request::GetPersonData).await
    }

    /// Typed control point dispatch for the fitness profile collaborator.
    pub async fn control(&self, request: ControlRequest) -> Result<(), SessionError> {
        match request {
            ControlRequest::Control => self.send(Request::Control).await,
            ControlRequest::Reset => self.restart().await,
            ControlRequest::SetPower(watts) => self.set_power(watts).await,
            ControlRequest::SetSimulation(params) => self.set_simulation(params).await,
        }
    }

    /// Close and reopen the channel, re-resolving the cockpit address.
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.send(Request::Restart).await
    }

    /// Stop the session for good. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<RunDataSample> {
        self.sample_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    async fn send(&self, request: Request) -> Result<(), SessionError> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// Mutable protocol state, owned exclusively by the session task.
struct SessionState {
    address: AddressState,
    queue: CommandQueue,
    last: LastValues,
    mode: SessionMode,
    shift_target: ShiftTarget,
    sim: SimulationParameters,
    failures: u32,
    startup_at: Option<Instant>,
    startup_sent: bool,
}

struct SessionCore {
    config: Config,
    state: SessionState,
    sample_tx: broadcast::Sender<RunDataSample>,
    event_tx: broadcast::Sender<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

/// The ergometer session itself. Construct with [`ErgoSession::new`], then
/// hand the returned future to the runtime via [`ErgoSession::run`].
pub struct ErgoSession {
    core: SessionCore,
    request_rx: mpsc::Receiver<Request>,
}

impl ErgoSession {
    pub fn new(config: Config) -> (Self, SessionHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (sample_tx, _) = broadcast::channel(64);
        let (event_tx, _) = broadcast::channel(64);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Disconnected);
        let cancel = CancellationToken::new();

        let state = SessionState {
            address: AddressState::Unresolved,
            queue: CommandQueue::new(config.queue.clone()),
            last: LastValues::default(),
            mode: config.session.mode,
            shift_target: config.session.shift_target,
            sim: SimulationParameters::default(),
            failures: 0,
            startup_at: None,
            startup_sent: false,
        };

        let handle = SessionHandle {
            request_tx,
            sample_tx: sample_tx.clone(),
            event_tx: event_tx.clone(),
            status_rx,
            cancel: cancel.clone(),
        };

        let session = Self {
            core: SessionCore {
                config,
                state,
                sample_tx,
                event_tx,
                status_tx,
                cancel,
            },
            request_rx,
        };

        (session, handle)
    }

    /// Run until stopped. A channel that cannot be opened is retried on a
    /// fixed backoff forever; the device may simply not be plugged in yet.
    pub async fn run(self) {
        let ErgoSession {
            mut core,
            mut request_rx,
        } = self;

        loop {
            if core.cancel.is_cancelled() {
                break;
            }
            core.status_tx.send_replace(SessionStatus::Opening);
            let Some(stream) = core.open_port().await else {
                break;
            };
            core.status_tx.send_replace(SessionStatus::Resolving);

            match core.drive(stream, &mut request_rx).await {
                Flow::Shutdown => break,
                Flow::Restart => {
                    core.status_tx.send_replace(SessionStatus::Error);
                    core.reset_for_restart();
                    let delay = sleep(Duration::from_millis(core.config.intervals.reopen_delay_ms));
                    tokio::select! {
                        _ = core.cancel.cancelled() => break,
                        _ = delay => {}
                    }
                }
            }
        }

        core.state.queue.clear();
        core.status_tx.send_replace(SessionStatus::Disconnected);
        let _ = core.event_tx.send(SessionEvent::Stopped);
        info!("ergometer session stopped");
    }
}

impl SessionCore {
    async fn open_port(&mut self) -> Option<tokio_serial::SerialStream> {
        loop {
            if let Some(path) = port::discover(&self.config.serial) {
                match port::open(&path, &self.config.serial) {
                    Ok(stream) => {
                        info!("serial channel open on {}", path);
                        let _ = self.event_tx.send(SessionEvent::PortOpened { path });
                        return Some(stream);
                    }
                    Err(e) => warn!("could not open {}: {}", path, e),
                }
            } else {
                debug!("no ergometer serial adapter found");
            }

            let delay = sleep(Duration::from_millis(self.config.intervals.open_retry_ms));
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = delay => {}
            }
        }
    }

    /// Drive one open channel until shutdown or a restart condition.
    async fn drive<S>(&mut self, stream: S, request_rx: &mut mpsc::Receiver<Request>) -> Flow
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (window_tx, mut window_rx) = mpsc::channel(32);
        let gap = Duration::from_millis(self.config.serial.window_gap_ms);
        let chunker = tokio::spawn(port::read_windows(reader, gap, window_tx));

        let mut tick = interval(Duration::from_millis(self.config.intervals.queue_tick_ms));
        let mut poll = interval(Duration::from_millis(self.config.intervals.run_data_ms));
        let mut addr_retry =
            interval(Duration::from_millis(self.config.intervals.address_retry_ms));
        for timer in [&mut tick, &mut poll, &mut addr_retry] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        let cancel = self.cancel.clone();
        let mut requests_open = true;

        let flow = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Flow::Shutdown,

                window = window_rx.recv() => match window {
                    Some(window) => {
                        if let Some(flow) = self.on_window(&window) {
                            break flow;
                        }
                    }
                    None => {
                        warn!("serial channel lost");
                        let _ = self.event_tx.send(SessionEvent::Restarting {
                            reason: "serial channel lost".to_string(),
                        });
                        break Flow::Restart;
                    }
                },

                request = request_rx.recv(), if requests_open => match request {
                    Some(request) => {
                        if let Some(flow) = self.on_request(request) {
                            break flow;
                        }
                    }
                    None => requests_open = false,
                },

                _ = tick.tick() => {
                    if let Err(e) = self.on_tick(&mut writer).await {
                        warn!("serial write failed: {}", e);
                        break Flow::Restart;
                    }
                }

                _ = poll.tick() => self.on_poll(),

                _ = addr_retry.tick(), if !self.state.address.is_resolved() => {
                    debug!("looking for cockpit address");
                    if let Err(e) = writer.write_all(&get_address_frame()).await {
                        warn!("serial write failed: {}", e);
                        break Flow::Restart;
                    }
                }
            }
        };

        chunker.abort();
        flow
    }

    /// Dispatch one incoming window.
    fn on_window(&mut self, window: &[u8]) -> Option<Flow> {
        debug!("[IN]: {}", hex(window));

        let AddressState::Resolved(address) = self.state.address else {
            if let Some(address) = frame::classify_address(window) {
                info!("cockpit address resolved: {:#04x}", address);
                self.state.address = AddressState::Resolved(address);
                self.state.startup_at = Some(
                    Instant::now()
                        + Duration::from_millis(self.config.intervals.startup_delay_ms),
                );
                self.status_tx.send_replace(SessionStatus::Running);
                let _ = self.event_tx.send(SessionEvent::AddressResolved { address });
            } else {
                debug!("ignoring window before address resolution");
            }
            return None;
        };

        let header = frame::response_header(window);
        let recognized = match header {
            Some((opcode_byte, response_address)) if response_address == address => {
                Opcode::from_byte(opcode_byte)
            }
            _ => None,
        };

        let Some(opcode) = recognized else {
            self.state.failures += 1;
            warn!(
                "unrecognized packet ({} consecutive): {}",
                self.state.failures,
                hex(window)
            );
            let _ = self.event_tx.send(SessionEvent::UnrecognizedResponse {
                bytes: window.to_vec(),
            });
            if self.state.failures >= self.config.session.max_failures {
                let _ = self.event_tx.send(SessionEvent::Restarting {
                    reason: "sustained protocol desync".to_string(),
                });
                return Some(Flow::Restart);
            }
            return None;
        };

        self.state.failures = 0;
        self.state.queue.acknowledge(opcode.byte(), address);

        if opcode == Opcode::RunData {
            if frame::check_run_data(window, &self.config.ranges) {
                self.apply_run_data(window);
            } else {
                warn!("run data response failed plausibility checks");
                let _ = self.event_tx.send(SessionEvent::InvalidRunData);
            }
        } else {
            debug!("{:?} response detected", opcode);
        }
        None
    }

    fn apply_run_data(&mut self, window: &[u8]) {
        let outcome = telemetry::interpret(
            window,
            &self.state.last,
            self.state.mode,
            &self.config.ranges,
            &self.config.gears,
            self.config.session.host_max_gear,
        );

        if let Some(limit) = outcome.corrective_gear {
            let reported = window[frame::OFFSET_GEAR];
            warn!("cockpit gear {} over host limit {}", reported, limit);
            let _ = self
                .event_tx
                .send(SessionEvent::GearLimited { reported, limit });
            self.enqueue(Opcode::SetGear, Some(limit), Priority::High);
        }

        if outcome.changed {
            let sample = outcome.values.to_sample(Utc::now());
            debug!(
                "sample: {}W {}rpm gear {} {:.1}km/h",
                sample.power, sample.rpm, sample.gear, sample.speed
            );
            let _ = self.sample_tx.send(sample);
        }
        self.state.last = outcome.values;

        // resistance must track cadence faster than the radio profile's one
        // second refresh, so SIM power is recomputed on every sample using
        // the telemetry we already have in hand
        if self.state.mode == SessionMode::Sim {
            let watts = simulation::compute_power(
                &self.state.sim,
                self.state.last.speed,
                &self.config.simulation,
            );
            self.enqueue_set_power(watts, Priority::Medium);
        }
    }

    fn on_request(&mut self, request: Request) -> Option<Flow> {
        match request {
            Request::SetPower(watts) => self.enqueue_set_power(watts, Priority::High),
            Request::SetGear(gear) => {
                let gear = self.clamp_gear(gear as i16);
                self.enqueue(Opcode::SetGear, Some(gear), Priority::High);
            }
            Request::SetProgram(program) => {
                let ranges = &self.config.ranges;
                let program = program.clamp(ranges.min_program, ranges.max_program);
                self.enqueue(Opcode::SetProgram, Some(program), Priority::High);
            }
            Request::SetWattProfile(profile) => {
                self.enqueue(Opcode::SetWattProfile, Some(profile.payload()), Priority::High);
            }
            Request::Shift(step) => match self.state.shift_target {
                ShiftTarget::Gear => self.shift_gear(step),
                ShiftTarget::Power => self.shift_power(step),
            },
            Request::ShiftGear(step) => self.shift_gear(step),
            Request::ShiftPower(step) => self.shift_power(step),
            Request::SetMode(mode) => {
                info!("session mode: {:?}", mode);
                self.state.mode = mode;
            }
            Request::SetShiftTarget(target) => {
                info!("shift target: {:?}", target);
                self.state.shift_target = target;
            }
            Request::SetSimulation(params) => {
                debug!(
                    "simulation: wind {:.1} grade {:.1} crr {:.4} cd {:.2}",
                    params.wind_speed, params.grade, params.crr, params.cd
                );
                self.state.sim = params;
            }
            Request::GetPersonData => self.enqueue(Opcode::GetPersonData, None, Priority::Low),
            Request::Control => {
                info!("trainer under remote control");
                let _ = self.event_tx.send(SessionEvent::ControlGranted);
            }
            Request::Restart => {
                info!("restart requested");
                let _ = self.event_tx.send(SessionEvent::Restarting {
                    reason: "requested".to_string(),
                });
                return Some(Flow::Restart);
            }
        }
        None
    }

    /// Queue tick: write at most one frame, report what got dropped.
    async fn on_tick<W>(&mut self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let outcome = self.state.queue.tick();
        for command in outcome.dropped {
            let _ = self.event_tx.send(SessionEvent::CommandDropped {
                opcode: command.opcode,
            });
        }
        if let Some(frame) = outcome.write {
            debug!("[OUT]: {}", hex(&frame));
            writer.write_all(&frame).await?;
        }
        Ok(())
    }

    /// Run data poll: fire the start-up sequence once its delay has passed,
    /// then keep exactly one telemetry request pending.
    fn on_poll(&mut self) {
        let AddressState::Resolved(address) = self.state.address else {
            return;
        };

        if !self.state.startup_sent {
            let Some(at) = self.state.startup_at else {
                return;
            };
            if Instant::now() < at {
                return;
            }
            // manual watt program first, then minimum gear so the cockpit
            // buttons shift gears rather than power
            let manual = self.config.ranges.manual_program;
            let min_gear = self.config.ranges.min_gear;
            self.enqueue(Opcode::SetProgram, Some(manual), Priority::High);
            self.enqueue(Opcode::SetGear, Some(min_gear), Priority::High);
            self.state.startup_sent = true;
        }

        if self.state.startup_sent && !self.state.queue.has_pending(Opcode::RunData.byte(), address)
        {
            self.enqueue(Opcode::RunData, None, Priority::Low);
        }
    }

    /// Queue a command for the resolved cockpit. Refused with an event
    /// while the address is still unknown.
    fn enqueue(&mut self, opcode: Opcode, payload: Option<u8>, priority: Priority) {
        let AddressState::Resolved(address) = self.state.address else {
            warn!("cannot send {:?}: no cockpit address", opcode);
            let _ = self.event_tx.send(SessionEvent::CommandRefused { opcode });
            return;
        };

        let command = match payload {
            Some(payload) => Command::with_payload(opcode, address, payload),
            None => Command::new(opcode, address),
        };
        if let Some(evicted) = self.state.queue.enqueue(command, priority) {
            let _ = self.event_tx.send(SessionEvent::QueueOverflow {
                opcode: evicted.opcode,
            });
        }
    }

    /// Clamp watts to the device's legal window and convert to its raw
    /// step, then queue a set watt command.
    fn enqueue_set_power(&mut self, watts: f64, priority: Priority) {
        let ranges = &self.config.ranges;
        let factor = ranges.power_factor as f64;
        let min = ranges.min_power as f64 * factor;
        let max = ranges.max_power as f64 * factor;
        let raw = (watts.clamp(min, max) / factor).round() as u8;
        self.enqueue(Opcode::SetWatt, Some(raw), priority);
    }

    fn clamp_gear(&self, gear: i16) -> u8 {
        let ranges = &self.config.ranges;
        let max = ranges.max_gear.min(self.config.session.host_max_gear);
        gear.clamp(ranges.min_gear as i16, max as i16) as u8
    }

    fn shift_gear(&mut self, step: ShiftStep) {
        let target = self.state.last.gear as i16 + step.steps(self.config.ranges.max_shift);
        let gear = self.clamp_gear(target);
        self.enqueue(Opcode::SetGear, Some(gear), Priority::High);
    }

    fn shift_power(&mut self, step: ShiftStep) {
        let step_watts =
            step.steps(self.config.ranges.max_shift) as f64 * self.config.ranges.power_factor as f64;
        let target = self.state.last.power as f64 + step_watts;
        self.enqueue_set_power(target, Priority::High);
    }

    fn reset_for_restart(&mut self) {
        self.state.queue.clear();
        self.state.address = AddressState::Unresolved;
        self.state.failures = 0;
        self.state.startup_at = None;
        self.state.startup_sent = false;
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
