//! Push-to-talk gating
//!
//! Turns raw key and focus events into transmit transitions. The gate is
//! driven entirely by caller-supplied timestamps, so tests control time
//! explicitly and the logic never reads the wall clock on its own.
//!
//! Transmission is the OR of two inputs: the bound key held past
//! `hold_time`, and the voice activity detector's speaking state. Key
//! release is debounced by `release_delay` so word endings are not
//! clipped; losing window focus releases immediately, skipping the delay.

use meshvoice_core::{Error, Result};
use std::time::{Duration, Instant};
use tracing::debug;

/// A bindable key plus modifier set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBinding {
    /// Platform key identifier (e.g. "F13", "CapsLock", "Mouse4")
    pub key: String,

    /// Modifier keys that must be held together with the key
    pub modifiers: Vec<Modifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Shift,
    Control,
    Alt,
    Meta,
}

impl KeyBinding {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            modifiers: Vec::new(),
        }
    }

    pub fn with_modifiers(mut self, modifiers: Vec<Modifier>) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Whether an observed key event matches this binding.
    pub fn matches(&self, key: &str, modifiers: &[Modifier]) -> bool {
        self.key == key && self.modifiers.iter().all(|m| modifiers.contains(m))
    }
}

/// Push-to-talk configuration
#[derive(Debug, Clone)]
pub struct PttConfig {
    /// Key that activates transmission
    pub binding: KeyBinding,

    /// How long the key must be held before transmission starts;
    /// filters accidental taps
    pub hold_time: Duration,

    /// How long transmission continues after release; avoids clipping
    /// the tail of the last word
    pub release_delay: Duration,

    /// When true, voice activity alone can open the gate
    pub vad_enabled: bool,
}

impl Default for PttConfig {
    fn default() -> Self {
        Self {
            binding: KeyBinding::new("F13"),
            hold_time: Duration::from_millis(50),
            release_delay: Duration::from_millis(150),
            vad_enabled: true,
        }
    }
}

impl PttConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.binding.key.is_empty() {
            return Err(Error::InvalidConfig("ptt key binding is empty".to_string()));
        }
        Ok(())
    }
}

/// Input events fed to the gate by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    KeyDown,
    KeyUp,
    FocusLost,
    FocusGained,
}

/// Emitted when the effective transmit state flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitTransition {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    /// Key up, no pending timers
    Idle,

    /// Key down, waiting out `hold_time`
    Arming { pressed_at: Instant },

    /// Key held past `hold_time`, gate open
    Engaged,

    /// Key released while engaged, gate stays open until the deadline
    Releasing { deadline: Instant },
}

/// Combines key state and voice activity into a single transmit flag.
pub struct PushToTalkGate {
    config: PttConfig,
    key_state: KeyState,
    vad_active: bool,
    transmitting: bool,
    transmit_started_at: Option<Instant>,
    total_transmit: Duration,
}

impl PushToTalkGate {
    pub fn new(config: PttConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            key_state: KeyState::Idle,
            vad_active: false,
            transmitting: false,
            transmit_started_at: None,
            total_transmit: Duration::ZERO,
        })
    }

    /// Current effective transmit state.
    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    /// Whether the key path of the gate is currently open.
    pub fn key_engaged(&self) -> bool {
        matches!(
            self.key_state,
            KeyState::Engaged | KeyState::Releasing { .. }
        )
    }

    /// Feed a platform input event. Returns a transition if the effective
    /// transmit state changed at `now`.
    pub fn handle_input(&mut self, event: InputEvent, now: Instant) -> Option<TransmitTransition> {
        match event {
            InputEvent::KeyDown => self.key_down(now),
            InputEvent::KeyUp => self.key_up(now),
            InputEvent::FocusLost => self.focus_lost(now),
            InputEvent::FocusGained => None,
        }
    }

    fn key_down(&mut self, now: Instant) -> Option<TransmitTransition> {
        match self.key_state {
            KeyState::Idle => {
                self.key_state = if self.config.hold_time.is_zero() {
                    KeyState::Engaged
                } else {
                    KeyState::Arming { pressed_at: now }
                };
                self.recompute(now)
            }
            // Re-press during the release window cancels the pending stop
            KeyState::Releasing { .. } => {
                debug!("ptt re-pressed within release window");
                self.key_state = KeyState::Engaged;
                self.recompute(now)
            }
            KeyState::Arming { .. } | KeyState::Engaged => None,
        }
    }

    fn key_up(&mut self, now: Instant) -> Option<TransmitTransition> {
        match self.key_state {
            // Released before hold_time elapsed: accidental tap, discard
            KeyState::Arming { .. } => {
                self.key_state = KeyState::Idle;
                self.recompute(now)
            }
            KeyState::Engaged => {
                self.key_state = KeyState::Releasing {
                    deadline: now + self.config.release_delay,
                };
                self.recompute(now)
            }
            KeyState::Idle | KeyState::Releasing { .. } => None,
        }
    }

    /// Focus loss releases the key path immediately, bypassing the
    /// release delay. The key-up event may never arrive once another
    /// window has keyboard focus.
    fn focus_lost(&mut self, now: Instant) -> Option<TransmitTransition> {
        if self.key_state != KeyState::Idle {
            debug!("focus lost, forcing ptt release");
        }
        self.key_state = KeyState::Idle;
        // VAD still holds the gate open if enabled and active
        self.recompute(now)
    }

    /// Feed the voice activity detector's speaking state.
    pub fn vad_changed(&mut self, speaking: bool, now: Instant) -> Option<TransmitTransition> {
        self.vad_active = speaking;
        self.recompute(now)
    }

    /// Advance timers. Call periodically (or whenever a deadline passes)
    /// to fire hold-time engagement and release-delay expiry.
    pub fn poll(&mut self, now: Instant) -> Option<TransmitTransition> {
        match self.key_state {
            KeyState::Arming { pressed_at } if now - pressed_at >= self.config.hold_time => {
                self.key_state = KeyState::Engaged;
            }
            KeyState::Releasing { deadline } if now >= deadline => {
                self.key_state = KeyState::Idle;
            }
            _ => {}
        }
        self.recompute(now)
    }

    /// Next deadline the caller should poll at, if any timer is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.key_state {
            KeyState::Arming { pressed_at } => Some(pressed_at + self.config.hold_time),
            KeyState::Releasing { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Total time the gate has been open, including the current run.
    pub fn total_transmit_time(&self, now: Instant) -> Duration {
        match self.transmit_started_at {
            Some(started) => self.total_transmit + now.saturating_duration_since(started),
            None => self.total_transmit,
        }
    }

    fn recompute(&mut self, now: Instant) -> Option<TransmitTransition> {
        let key_open = matches!(
            self.key_state,
            KeyState::Engaged | KeyState::Releasing { .. }
        );
        let vad_open = self.config.vad_enabled && self.vad_active;
        let next = key_open || vad_open;

        if next == self.transmitting {
            return None;
        }
        self.transmitting = next;
        if next {
            self.transmit_started_at = Some(now);
            Some(TransmitTransition::Started)
        } else {
            if let Some(started) = self.transmit_started_at.take() {
                self.total_transmit += now.saturating_duration_since(started);
            }
            Some(TransmitTransition::Stopped)
        }
    }
}
