//! Admission control for outgoing messages.
//!
//! AIMD window in messages per tick, driven by the quality snapshot:
//! - healthy tick: `window += additive_increase`
//! - loss >= `loss_limit` or srtt > `rtt_limit_ms`: `window *= multiplicative_decrease`
//!
//! Every tick refills the send credits to `floor(window)`.
//!
//! States:
//! - `Open`: forward while credits last; exhausted credits queue the message
//! - `Congested`: every send is queued (FIFO) and paced out by the pipeline tick
//! - `Rejecting`: queue reached `queue_bound`; new sends fail fast
//!
//! The queue never holds more than `queue_bound` messages.

use std::collections::VecDeque;

use network_shared::config::FlowControlSettings;
use tracing::{debug, info};

use crate::{
    message::Message,
    stage::{Flow, Stage, StageContext, StageError, StageKind, TickContext},
    stages::quality::QualityHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    Open,
    Congested,
    Rejecting,
}

pub struct FlowControlStage {
    settings: FlowControlSettings,
    quality: QualityHandle,
    state: FlowState,
    window: f64,
    credits: u32,
    queue: VecDeque<Message>,
}

impl FlowControlStage {
    pub fn new(settings: FlowControlSettings, quality: QualityHandle) -> Self {
        let window = settings.initial_window;
        let mut stage = Self {
            settings,
            quality,
            state: FlowState::Open,
            window,
            credits: window.floor() as u32,
            queue: VecDeque::new(),
        };
        stage.settle();
        stage
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    fn enqueue(&mut self, msg: Message) {
        self.queue.push_back(msg);
        self.settle();
    }

    /// Derives the state from queue depth and window.
    fn settle(&mut self) {
        let next = if self.queue.len() >= self.settings.queue_bound {
            FlowState::Rejecting
        } else if !self.queue.is_empty() || self.window < self.settings.open_threshold {
            FlowState::Congested
        } else {
            FlowState::Open
        };
        if next != self.state {
            if next == FlowState::Rejecting {
                info!(target: "net::flow", queued = self.queue.len(), window = self.window, "flow control rejecting");
            } else {
                debug!(target: "net::flow", from = ?self.state, to = ?next, queued = self.queue.len(), window = self.window, "flow state changed");
            }
            self.state = next;
        }
    }
}

impl Stage for FlowControlStage {
    fn kind(&self) -> StageKind {
        StageKind::FlowControl
    }

    fn outgoing(&mut self, msg: Message, cx: &mut StageContext<'_>) -> Result<Flow, StageError> {
        match self.state {
            FlowState::Rejecting => {
                cx.pool.release(msg.into_payload());
                Ok(Flow::Rejected)
            }
            FlowState::Open if self.credits > 0 => {
                self.credits -= 1;
                Ok(Flow::Forward(msg))
            }
            FlowState::Open | FlowState::Congested => {
                self.enqueue(msg);
                Ok(Flow::Queued)
            }
        }
    }

    fn incoming(&mut self, msg: Message, _cx: &mut StageContext<'_>) -> Result<Message, StageError> {
        Ok(msg)
    }

    fn on_tick(&mut self, _tick: &TickContext) {
        let metrics = self.quality.snapshot();
        let s = &self.settings;
        let rtt_high = metrics
            .srtt
            .is_some_and(|srtt| u64::try_from(srtt.as_millis()).unwrap_or(u64::MAX) > s.rtt_limit_ms);
        let congested = metrics.loss_rate >= s.loss_limit || rtt_high;

        self.window = if congested {
            (self.window * s.multiplicative_decrease).max(s.min_window)
        } else {
            (self.window + s.additive_increase).min(s.max_window)
        };
        self.credits = self.window.floor() as u32;
        self.settle();
    }

    fn poll_release(&mut self) -> Option<Message> {
        if self.credits == 0 {
            return None;
        }
        let msg = self.queue.pop_front()?;
        self.credits -= 1;
        self.settle();
        Some(msg)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }

    fn flow_state(&self) -> Option<FlowState> {
        Some(self.state)
    }

    fn dispose(&mut self) {
        self.queue.clear();
    }
}
