use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{DEFAULT_TRAFFIC_HIGHLIGHT_MS, DEFAULT_WATCHDOG_MS};
use crate::playout::PlayoutEngine;

// --- Channel controller ----------------------------------------------------------
//
// Client-side state for every channel:
//
//   OFF --toggle--> ON --toggle / inactivity--> OFF
//
// plus two orthogonal flags:
//   - muted: gain forced to 0, but the ring keeps filling and draining so
//     unmuting resumes in step with the stream
//   - traffic: payloads are arriving for a channel that is OFF; clears after
//     a quiet period and never touches the audio path
//
// Inactivity watchdog: every payload re-arms a short per-channel timer. If it
// fires while the channel is ON, upstream has gone quiet and the channel is
// switched OFF as if the operator had toggled it, except that mute is reset.
//
// Each channel sits behind its own mutex; all work under it is O(1) apart
// from copying one payload into the ring. Timers are tokio tasks. Re-arming
// aborts the previous task *and* bumps a generation number, so a timer that
// already woke up but lost the race for the lock sees a newer generation and
// does nothing.

pub const DEFAULT_MASTER_VOLUME: f32 = 0.5;
pub const DEFAULT_CHANNEL_VOLUME: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub watchdog: Duration,
    pub traffic_highlight: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_millis(DEFAULT_WATCHDOG_MS),
            traffic_highlight: Duration::from_millis(DEFAULT_TRAFFIC_HIGHLIGHT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffReason {
    /// Operator toggled it.
    User,
    /// Watchdog: no payload within the timeout.
    Inactivity,
    /// Configuration reset.
    Cleared,
}

/// Channel numbers in events are 0-based indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    On { channel: usize },
    Off { channel: usize, reason: OffReason },
    TrafficStarted { channel: usize },
    TrafficCleared { channel: usize },
    MuteChanged { channel: usize, muted: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Off,
    On,
}

/// Point-in-time view of one channel, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    /// 1-based, as shown to operators.
    pub channel: usize,
    pub state: PowerState,
    pub traffic: bool,
    pub muted: bool,
    pub volume: f32,
    pub pan: f32,
    pub gain: f32,
    pub buffered: usize,
    pub packets: u64,
    pub last_packet_ms_ago: Option<u64>,
}

#[derive(Debug)]
struct ChannelState {
    active: bool,
    muted: bool,
    volume: f32,
    pan: f32,
    traffic: bool,
    packets: u64,
    last_packet: Option<Instant>,
    watchdog: Option<JoinHandle<()>>,
    watchdog_gen: u64,
    traffic_timer: Option<JoinHandle<()>>,
    traffic_gen: u64,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            active: false,
            muted: false,
            volume: DEFAULT_CHANNEL_VOLUME,
            pan: 0.0,
            traffic: false,
            packets: 0,
            last_packet: None,
            watchdog: None,
            watchdog_gen: 0,
            traffic_timer: None,
            traffic_gen: 0,
        }
    }
}

impl ChannelState {
    fn cancel_watchdog(&mut self) {
        if let Some(h) = self.watchdog.take() {
            h.abort();
        }
        self.watchdog_gen += 1;
    }

    fn cancel_traffic_timer(&mut self) {
        if let Some(h) = self.traffic_timer.take() {
            h.abort();
        }
        self.traffic_gen += 1;
    }
}

struct Inner {
    engine: Arc<PlayoutEngine>,
    channels: Box<[Mutex<ChannelState>]>,
    master: AtomicU32,
    settings: ControllerSettings,
    events: broadcast::Sender<ChannelEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for ch in self.channels.iter_mut() {
            if let Ok(st) = ch.get_mut() {
                st.cancel_watchdog();
                st.cancel_traffic_timer();
            }
        }
    }
}

/// Registry of every channel's state. Cheap to clone; all clones share state.
///
/// Methods that handle payloads spawn timers and must run inside a tokio
/// runtime. Out-of-range channel indices are ignored.
#[derive(Clone)]
pub struct ChannelController {
    inner: Arc<Inner>,
}

impl ChannelController {
    pub fn new(engine: Arc<PlayoutEngine>, settings: ControllerSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        let channels = (0..engine.channels())
            .map(|_| Mutex::new(ChannelState::default()))
            .collect();
        let ctl = Self {
            inner: Arc::new(Inner {
                engine,
                channels,
                master: AtomicU32::new(DEFAULT_MASTER_VOLUME.to_bits()),
                settings,
                events,
            }),
        };
        for ch in 0..ctl.channels() {
            ctl.inner.engine.set_gain(ch, 0.0);
            ctl.inner.engine.set_pan(ch, 0.0);
        }
        ctl
    }

    pub fn channels(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn engine(&self) -> &Arc<PlayoutEngine> {
        &self.inner.engine
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn master_volume(&self) -> f32 {
        f32::from_bits(self.inner.master.load(Ordering::Relaxed))
    }

    /// The gain the render thread is currently applying.
    pub fn effective_gain(&self, channel: usize) -> f32 {
        self.inner.engine.gain(channel)
    }

    pub fn is_on(&self, channel: usize) -> bool {
        self.lock(channel).is_some_and(|st| st.active)
    }

    pub fn has_traffic(&self, channel: usize) -> bool {
        self.lock(channel).is_some_and(|st| st.traffic)
    }

    pub fn is_muted(&self, channel: usize) -> bool {
        self.lock(channel).is_some_and(|st| st.muted)
    }

    // --- Operator actions -------------------------------------------------------

    /// Flip ON/OFF. Returns the new state, or `None` for an unknown channel.
    pub fn toggle(&self, channel: usize) -> Option<bool> {
        let mut st = self.lock(channel)?;
        if st.active {
            self.switch_off(channel, &mut st, OffReason::User);
        } else {
            self.switch_on(channel, &mut st);
        }
        Some(st.active)
    }

    pub fn turn_on(&self, channel: usize) {
        if let Some(mut st) = self.lock(channel) {
            if !st.active {
                self.switch_on(channel, &mut st);
            }
        }
    }

    pub fn turn_off(&self, channel: usize) {
        if let Some(mut st) = self.lock(channel) {
            if st.active {
                self.switch_off(channel, &mut st, OffReason::User);
            }
        }
    }

    pub fn toggle_mute(&self, channel: usize) -> Option<bool> {
        let mut st = self.lock(channel)?;
        st.muted = !st.muted;
        self.apply_gain(channel, &st);
        self.emit(ChannelEvent::MuteChanged { channel, muted: st.muted });
        Some(st.muted)
    }

    /// Mute every channel that is ON and audible.
    pub fn mute_all(&self) {
        for channel in 0..self.channels() {
            if let Some(mut st) = self.lock(channel) {
                if st.active && !st.muted {
                    st.muted = true;
                    self.apply_gain(channel, &st);
                    self.emit(ChannelEvent::MuteChanged { channel, muted: true });
                }
            }
        }
    }

    /// Undo `mute_all` (and any individual mutes) on channels that are ON.
    pub fn cancel_mute(&self) {
        for channel in 0..self.channels() {
            if let Some(mut st) = self.lock(channel) {
                if st.active && st.muted {
                    st.muted = false;
                    self.apply_gain(channel, &st);
                    self.emit(ChannelEvent::MuteChanged { channel, muted: false });
                }
            }
        }
    }

    pub fn set_volume(&self, channel: usize, volume: f32) {
        if let Some(mut st) = self.lock(channel) {
            st.volume = clamp_unit(volume);
            self.apply_gain(channel, &st);
        }
    }

    pub fn set_pan(&self, channel: usize, pan: f32) {
        if let Some(mut st) = self.lock(channel) {
            st.pan = if pan.is_finite() { pan.clamp(-1.0, 1.0) } else { 0.0 };
            self.inner.engine.set_pan(channel, st.pan);
        }
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.inner
            .master
            .store(clamp_unit(volume).to_bits(), Ordering::Relaxed);
        for channel in 0..self.channels() {
            if let Some(st) = self.lock(channel) {
                self.apply_gain(channel, &st);
            }
        }
    }

    /// Everything OFF and unmuted, volumes 0.5, pans centred, master 0.5.
    pub fn clear_configuration(&self) {
        self.inner
            .master
            .store(DEFAULT_MASTER_VOLUME.to_bits(), Ordering::Relaxed);
        for channel in 0..self.channels() {
            if let Some(mut st) = self.lock(channel) {
                if st.active {
                    self.switch_off(channel, &mut st, OffReason::Cleared);
                }
                st.muted = false;
                st.volume = DEFAULT_CHANNEL_VOLUME;
                st.pan = 0.0;
                self.inner.engine.set_pan(channel, 0.0);
                self.apply_gain(channel, &st);
            }
        }
        info!("configuration cleared");
    }

    // --- Network side -----------------------------------------------------------

    /// A decoded payload arrived for `channel`.
    ///
    /// Buffered only if the channel's playout path is up; either way it counts
    /// as a sign of life and re-arms the inactivity watchdog. On an OFF channel
    /// it also raises the traffic highlight.
    pub fn on_payload(&self, channel: usize, samples: &[f32]) {
        let Some(mut st) = self.lock(channel) else {
            return;
        };

        self.inner.engine.push(channel, samples);
        st.packets += 1;
        st.last_packet = Some(Instant::now());

        if !st.active {
            if !st.traffic {
                st.traffic = true;
                self.emit(ChannelEvent::TrafficStarted { channel });
            }
            self.arm_traffic_timer(channel, &mut st);
        }
        self.arm_watchdog(channel, &mut st);
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        (0..self.channels())
            .filter_map(|channel| {
                let st = self.lock(channel)?;
                Some(ChannelSnapshot {
                    channel: channel + 1,
                    state: if st.active { PowerState::On } else { PowerState::Off },
                    traffic: st.traffic,
                    muted: st.muted,
                    volume: st.volume,
                    pan: st.pan,
                    gain: self.inner.engine.gain(channel),
                    buffered: self
                        .inner
                        .engine
                        .strip(channel)
                        .map_or(0, |s| s.ring().available()),
                    packets: st.packets,
                    last_packet_ms_ago: st.last_packet.map(|t| t.elapsed().as_millis() as u64),
                })
            })
            .collect()
    }

    // --- Internals --------------------------------------------------------------

    fn lock(&self, channel: usize) -> Option<MutexGuard<'_, ChannelState>> {
        let m = self.inner.channels.get(channel)?;
        // A panic while holding a channel lock leaves plain data behind; keep going.
        Some(m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn emit(&self, ev: ChannelEvent) {
        debug!("channel event: {ev:?}");
        // No subscribers is fine.
        let _ = self.inner.events.send(ev);
    }

    fn apply_gain(&self, channel: usize, st: &ChannelState) {
        let gain = if st.active && !st.muted {
            self.master_volume() * st.volume
        } else {
            0.0
        };
        self.inner.engine.set_gain(channel, gain);
    }

    fn switch_on(&self, channel: usize, st: &mut ChannelState) {
        st.active = true;
        if st.traffic {
            st.traffic = false;
            st.cancel_traffic_timer();
            self.emit(ChannelEvent::TrafficCleared { channel });
        }
        self.inner.engine.connect(channel);
        self.inner.engine.set_pan(channel, st.pan);
        self.apply_gain(channel, st);
        info!("channel {} on", channel + 1);
        self.emit(ChannelEvent::On { channel });
    }

    fn switch_off(&self, channel: usize, st: &mut ChannelState, reason: OffReason) {
        st.active = false;
        st.cancel_watchdog();
        self.inner.engine.disconnect(channel);
        self.apply_gain(channel, st);
        info!("channel {} off ({reason:?})", channel + 1);
        self.emit(ChannelEvent::Off { channel, reason });
    }

    fn arm_watchdog(&self, channel: usize, st: &mut ChannelState) {
        st.cancel_watchdog();
        let generation = st.watchdog_gen;
        let timeout = self.inner.settings.watchdog;
        let weak = Arc::downgrade(&self.inner);
        st.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(ctl) = upgrade(&weak) {
                ctl.watchdog_fired(channel, generation, timeout);
            }
        }));
    }

    fn watchdog_fired(&self, channel: usize, generation: u64, timeout: Duration) {
        let Some(mut st) = self.lock(channel) else {
            return;
        };
        if st.watchdog_gen != generation {
            return;
        }
        st.watchdog = None;
        if st.active {
            info!(
                "no packets on channel {} for {}ms, stopping",
                channel + 1,
                timeout.as_millis()
            );
            // Lost signal resets mute; a user stop keeps it.
            if st.muted {
                st.muted = false;
                self.emit(ChannelEvent::MuteChanged { channel, muted: false });
            }
            self.switch_off(channel, &mut st, OffReason::Inactivity);
        }
    }

    fn arm_traffic_timer(&self, channel: usize, st: &mut ChannelState) {
        st.cancel_traffic_timer();
        let generation = st.traffic_gen;
        let timeout = self.inner.settings.traffic_highlight;
        let weak = Arc::downgrade(&self.inner);
        st.traffic_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(ctl) = upgrade(&weak) {
                ctl.traffic_expired(channel, generation);
            }
        }));
    }

    fn traffic_expired(&self, channel: usize, generation: u64) {
        let Some(mut st) = self.lock(channel) else {
            return;
        };
        if st.traffic_gen != generation {
            return;
        }
        st.traffic_timer = None;
        if st.traffic {
            st.traffic = false;
            self.emit(ChannelEvent::TrafficCleared { channel });
        }
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<ChannelController> {
    weak.upgrade().map(|inner| ChannelController { inner })
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

// --- Operator command line -------------------------------------------------------

/// One line of operator input. Channel numbers are 1-based, as operators count.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Toggle(usize),
    On(usize),
    Off(usize),
    Mute(usize),
    MuteAll,
    CancelMute,
    Volume(usize, f32),
    Pan(usize, f32),
    Master(f32),
    Clear,
    Status,
}

impl ControlCommand {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<&str> = parts.collect();

        let channel = |i: usize| -> anyhow::Result<usize> {
            let raw = args.get(i).ok_or_else(|| anyhow::anyhow!("{verb}: missing channel"))?;
            let n: usize = raw.parse().map_err(|_| anyhow::anyhow!("bad channel: {raw}"))?;
            n.checked_sub(1)
                .ok_or_else(|| anyhow::anyhow!("channels are numbered from 1"))
        };
        let level = |i: usize| -> anyhow::Result<f32> {
            let raw = args.get(i).ok_or_else(|| anyhow::anyhow!("{verb}: missing value"))?;
            raw.parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| anyhow::anyhow!("bad value: {raw}"))
        };

        Ok(match verb.as_str() {
            "toggle" | "t" => ControlCommand::Toggle(channel(0)?),
            "on" => ControlCommand::On(channel(0)?),
            "off" => ControlCommand::Off(channel(0)?),
            "mute" | "m" => ControlCommand::Mute(channel(0)?),
            "muteall" => ControlCommand::MuteAll,
            "unmuteall" | "cancelmute" => ControlCommand::CancelMute,
            "vol" | "volume" => ControlCommand::Volume(channel(0)?, level(1)?),
            "pan" => ControlCommand::Pan(channel(0)?, level(1)?),
            "master" => ControlCommand::Master(level(0)?),
            "clear" => ControlCommand::Clear,
            "status" | "s" => ControlCommand::Status,
            "" => anyhow::bail!("empty command"),
            other => anyhow::bail!("unknown command: {other}"),
        })
    }

    /// Apply to the controller. `Status` is answered with a JSON snapshot.
    pub fn apply(&self, ctl: &ChannelController) -> Option<String> {
        match *self {
            ControlCommand::Toggle(ch) => {
                ctl.toggle(ch);
            }
            ControlCommand::On(ch) => ctl.turn_on(ch),
            ControlCommand::Off(ch) => ctl.turn_off(ch),
            ControlCommand::Mute(ch) => {
                ctl.toggle_mute(ch);
            }
            ControlCommand::MuteAll => ctl.mute_all(),
            ControlCommand::CancelMute => ctl.cancel_mute(),
            ControlCommand::Volume(ch, v) => ctl.set_volume(ch, v),
            ControlCommand::Pan(ch, p) => ctl.set_pan(ch, p),
            ControlCommand::Master(v) => ctl.set_master_volume(v),
            ControlCommand::Clear => ctl.clear_configuration(),
            ControlCommand::Status => {
                return serde_json::to_string_pretty(&serde_json::json!({
                    "master": ctl.master_volume(),
                    "channels": ctl.snapshot(),
                }))
                .ok();
            }
        }
        None
    }
}
