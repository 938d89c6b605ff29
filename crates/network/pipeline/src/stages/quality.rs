//! Link quality measurement.
//!
//! The stage sits nearest the transport. Every outgoing packet gets a small
//! probe header:
//!
//! `[sequence: u32][echo: u32][hold_ms: u16]` (10 bytes, big endian)
//!
//! - `sequence` numbers this side's packets (starting at 1)
//! - `echo` repeats the newest sequence received from the peer (0 = none)
//! - `hold_ms` is how long that packet sat here before this one went out
//!
//! An echo of one of our own sequences yields an RTT sample
//! (`now - sent_at - hold`). Gaps in incoming sequences and transport-reported
//! loss both count as lost packets. The stage never drops or delays traffic;
//! results are published through a [`QualityHandle`].
//!
//! An incoming header is only committed once the rest of the chain accepted
//! the packet, so rejected or forged packets leave the estimates untouched.

use std::{
    collections::VecDeque,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut};
use network_shared::{LinkStats, config::QualitySettings};
use tracing::{debug, trace};

use crate::{
    message::Message,
    stage::{Flow, Stage, StageContext, StageError, StageKind, TickContext},
};

pub const QUALITY_HEADER_LEN: usize = 10;

/// Coarse link classification derived from the thresholds in [`QualitySettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkHealth {
    #[default]
    Good,
    Degraded,
    Bad,
}

/// Read-only metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QualityMetrics {
    /// Smoothed RTT, `None` until the first sample.
    pub srtt: Option<Duration>,
    pub rttvar: Duration,
    pub last_rtt: Option<Duration>,
    pub rtt_samples: u64,
    /// Lost / observed over the rolling tick window.
    pub loss_rate: f64,
    pub packets_observed: u64,
    pub packets_lost: u64,
    pub health: LinkHealth,
    /// Set once the owning stage was disposed.
    pub closed: bool,
}

/// Shared view onto a quality stage's metrics.
#[derive(Debug, Clone, Default)]
pub struct QualityHandle {
    inner: Arc<RwLock<QualityMetrics>>,
}

impl QualityHandle {
    pub fn snapshot(&self) -> QualityMetrics {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.snapshot().closed
    }

    fn publish(&self, metrics: QualityMetrics) {
        match self.inner.write() {
            Ok(mut guard) => *guard = metrics,
            Err(poisoned) => *poisoned.into_inner() = metrics,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    observed: u64,
    lost: u64,
}

/// Probe header of an incoming packet, held until the chain accepts it.
#[derive(Debug, Clone, Copy)]
struct Observation {
    sequence: u32,
    echo: u32,
    hold: Duration,
    at: Instant,
}

/// Largest sequence gap a single packet may book as loss.
const MAX_COUNTED_GAP: u64 = 1024;

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct QualityStage {
    settings: QualitySettings,
    handle: QualityHandle,
    metrics: QualityMetrics,

    next_sequence: u32,
    /// Our outstanding sequences and their send time, oldest first.
    in_flight: VecDeque<(u32, Instant)>,
    /// Newest peer sequence and when it arrived.
    last_received: Option<(u32, Instant)>,
    pending: Option<Observation>,

    current: Bucket,
    window: VecDeque<Bucket>,
    link_baseline: LinkStats,
    /// Largest packet the transport accepts, header included.
    max_packet_size: usize,
}

impl QualityStage {
    /// `link_baseline` is the transport's counter state at creation; only
    /// later deltas count.
    pub fn new(settings: QualitySettings, link_baseline: LinkStats) -> Self {
        Self {
            window: VecDeque::with_capacity(settings.window_ticks),
            settings,
            handle: QualityHandle::default(),
            metrics: QualityMetrics::default(),
            next_sequence: 1,
            in_flight: VecDeque::new(),
            last_received: None,
            pending: None,
            current: Bucket::default(),
            link_baseline,
            max_packet_size: usize::MAX,
        }
    }

    /// Limits outgoing packets to what the transport accepts in one send.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn handle(&self) -> QualityHandle {
        self.handle.clone()
    }

    pub fn metrics(&self) -> QualityMetrics {
        self.metrics
    }

    fn record_rtt(&mut self, sample: Duration) {
        let metrics = &mut self.metrics;
        match metrics.srtt {
            None => {
                metrics.srtt = Some(sample);
                metrics.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if srtt > sample { srtt - sample } else { sample - srtt };
                metrics.rttvar = (metrics.rttvar * 3 + delta) / 4;
                metrics.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
        metrics.last_rtt = Some(sample);
        metrics.rtt_samples += 1;
    }

    fn classify(&self) -> LinkHealth {
        let s = &self.settings;
        let srtt_ms = self.metrics.srtt.map_or(0, millis);
        let loss = self.metrics.loss_rate;
        if loss >= s.bad_loss || srtt_ms > s.bad_rtt_ms {
            LinkHealth::Bad
        } else if loss >= s.degraded_loss || srtt_ms > s.degraded_rtt_ms {
            LinkHealth::Degraded
        } else {
            LinkHealth::Good
        }
    }
}

impl Stage for QualityStage {
    fn kind(&self) -> StageKind {
        StageKind::Quality
    }

    fn outgoing(&mut self, mut msg: Message, cx: &mut StageContext<'_>) -> Result<Flow, StageError> {
        let wire_len = QUALITY_HEADER_LEN + msg.size();
        if wire_len > self.max_packet_size {
            cx.pool.release(msg.into_payload());
            return Err(StageError::encode(format!(
                "packet of {wire_len} bytes exceeds transport limit {}",
                self.max_packet_size
            )));
        }
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);

        let (echo, hold_ms) = match self.last_received {
            Some((peer_seq, at)) => {
                let held = millis(cx.now.saturating_duration_since(at));
                (peer_seq, u16::try_from(held).unwrap_or(u16::MAX))
            }
            None => (0, 0),
        };

        let mut probed = cx.pool.acquire(wire_len);
        probed.put_u32(sequence);
        probed.put_u32(echo);
        probed.put_u16(hold_ms);
        probed.extend_from_slice(msg.payload());
        let old = msg.replace_payload(probed);
        cx.pool.release(old);

        self.in_flight.push_back((sequence, cx.now));
        while self.in_flight.len() > self.settings.max_outstanding_probes {
            self.in_flight.pop_front();
        }
        Ok(Flow::Forward(msg))
    }

    fn incoming(&mut self, mut msg: Message, cx: &mut StageContext<'_>) -> Result<Message, StageError> {
        self.pending = None;
        if msg.size() < QUALITY_HEADER_LEN {
            let len = msg.size();
            cx.pool.release(msg.into_payload());
            return Err(StageError::decode(format!(
                "probe header truncated ({len} bytes)"
            )));
        }
        let payload = msg.payload_mut();
        self.pending = Some(Observation {
            sequence: payload.get_u32(),
            echo: payload.get_u32(),
            hold: Duration::from_millis(u64::from(payload.get_u16())),
            at: cx.now,
        });
        Ok(msg)
    }

    fn commit_incoming(&mut self, cx: &mut StageContext<'_>) {
        let Some(seen) = self.pending.take() else {
            return;
        };

        self.current.observed += 1;
        match self.last_received {
            None => self.last_received = Some((seen.sequence, seen.at)),
            Some((last, _)) => {
                // Serial-number comparison; sequences wrap and skip 0. Reordered
                // or duplicated packets are counted but never move the echo back.
                let distance = seen.sequence.wrapping_sub(last);
                if distance != 0 && distance <= u32::MAX / 2 {
                    let wrapped = u64::from(seen.sequence < last);
                    let skipped = u64::from(distance - 1).saturating_sub(wrapped);
                    if skipped > MAX_COUNTED_GAP {
                        debug!(target: "net::quality", conn = %cx.connection_id, last, sequence = seen.sequence, "sequence jump, loss capped");
                    }
                    let gap = skipped.min(MAX_COUNTED_GAP);
                    self.current.lost += gap;
                    self.current.observed += gap;
                    self.last_received = Some((seen.sequence, seen.at));
                }
            }
        }

        if seen.echo != 0 {
            if let Some(pos) = self.in_flight.iter().position(|(seq, _)| *seq == seen.echo) {
                let (_, sent_at) = self.in_flight[pos];
                self.in_flight.drain(..=pos);
                let sample = seen.at.saturating_duration_since(sent_at).saturating_sub(seen.hold);
                self.record_rtt(sample);
                trace!(target: "net::quality", conn = %cx.connection_id, rtt_us = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX), "rtt sample");
            }
        }
    }

    fn on_tick(&mut self, tick: &TickContext) {
        let sent = tick.link.packets_sent.saturating_sub(self.link_baseline.packets_sent);
        let lost = tick.link.packets_lost.saturating_sub(self.link_baseline.packets_lost);
        self.link_baseline = tick.link;
        self.current.observed += sent;
        self.current.lost += lost;

        self.window.push_back(std::mem::take(&mut self.current));
        while self.window.len() > self.settings.window_ticks {
            self.window.pop_front();
        }
        let (observed, lost) = self
            .window
            .iter()
            .fold((0u64, 0u64), |(o, l), b| (o + b.observed, l + b.lost));

        self.metrics.packets_observed += self.window.back().map_or(0, |b| b.observed);
        self.metrics.packets_lost += self.window.back().map_or(0, |b| b.lost);
        self.metrics.loss_rate = if observed == 0 {
            0.0
        } else {
            (lost as f64 / observed as f64).min(1.0)
        };

        let health = self.classify();
        if health != self.metrics.health {
            debug!(
                target: "net::quality",
                from = ?self.metrics.health,
                to = ?health,
                loss = self.metrics.loss_rate,
                srtt_ms = self.metrics.srtt.map(millis),
                "link health changed"
            );
        }
        self.metrics.health = health;
        self.handle.publish(self.metrics);
    }

    fn quality_handle(&self) -> Option<QualityHandle> {
        Some(self.handle())
    }

    fn dispose(&mut self) {
        self.pending = None;
        self.in_flight.clear();
        self.window.clear();
        self.metrics.closed = true;
        self.handle.publish(self.metrics);
    }
}
