use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::matcher::{classify, Correlation, PendingIndex};
use crate::net::channel::{Channel, ListenerId, PacketListener};
use crate::net::socket::Socket;
use crate::packet::Packet;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// A sent packet paired with a packet which answered it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Answer {
    pub sent: Packet,
    pub received: Packet,
    pub correlation: Correlation,
    pub sent_at: Instant,
    pub received_at: Instant,
}

impl Answer {
    /// The round trip time of the answer.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.received_at.saturating_duration_since(self.sent_at)
    }
}

/// Why a probe session completed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompletionReason {
    /// There was nothing to send.
    Empty,
    /// As many answers were recorded as packets were sent.
    AllAnswered,
    /// The configured number of expected answers was recorded.
    ExpectedAnswers,
    /// The session deadline passed.
    TimedOut,
    /// The channel closed before the session could complete.
    ChannelClosed,
}

/// The result of a probe session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProbeOutcome {
    /// Answers in the order they were matched.
    pub answered: Vec<Answer>,
    /// Packets with no answer, in the order they were given.
    pub unanswered: Vec<Packet>,
    pub reason: CompletionReason,
}

/// Sends a batch of packets and collects the packets which answer them.
///
/// A session is a [`PacketListener`] registered with a [`Channel`] for as long as it runs. It is
/// driven through the [`SessionHandle`] returned by [`ProbeSession::start_sending`].
pub struct ProbeSession<S: Socket> {
    channel: Rc<Channel<S>>,
    config: SessionConfig,
    listener_id: Option<ListenerId>,
    pending: PendingIndex,
    unsent: VecDeque<usize>,
    next_send_at: Option<Instant>,
    sent: usize,
    answered: Vec<Answer>,
    deadline: Instant,
    reason: Option<CompletionReason>,
}

impl<S: Socket + 'static> ProbeSession<S> {
    /// Register a new session with `channel` and start sending `packets`.
    ///
    /// The session is registered before the first packet is written so no answer can be missed.
    /// An empty batch completes immediately with [`CompletionReason::Empty`].
    #[instrument(skip_all, level = "trace")]
    pub fn start_sending(
        channel: &Rc<Channel<S>>,
        packets: Vec<Packet>,
        config: SessionConfig,
    ) -> Result<SessionHandle<S>> {
        tracing::debug!(?config, packets = packets.len());
        if channel.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let started_at = Instant::now();
        let mut pending = PendingIndex::new();
        let unsent = packets
            .into_iter()
            .map(|packet| pending.insert(packet))
            .collect::<VecDeque<_>>();
        let session = Rc::new(RefCell::new(Self {
            channel: Rc::clone(channel),
            config,
            listener_id: None,
            pending,
            unsent,
            next_send_at: None,
            sent: 0,
            answered: vec![],
            deadline: started_at + config.timeout,
            reason: None,
        }));
        let handle = SessionHandle {
            channel: Rc::clone(channel),
            session: Rc::clone(&session),
        };
        if session.borrow().unsent.is_empty() {
            session.borrow_mut().complete(CompletionReason::Empty);
            return Ok(handle);
        }
        let id = channel.register(session.clone())?;
        let mut session = session.borrow_mut();
        session.listener_id = Some(id);
        session.send_due(started_at);
        Ok(handle)
    }
}

impl<S: Socket> ProbeSession<S> {
    fn send_due(&mut self, now: Instant) {
        while let Some(&slot) = self.unsent.front() {
            if self.next_send_at.is_some_and(|at| at > now) {
                break;
            }
            self.unsent.pop_front();
            self.send_slot(slot);
            if !self.config.send_interval.is_zero() {
                self.next_send_at = Some(Instant::now() + self.config.send_interval);
            }
        }
        self.check_complete(now);
    }

    fn send_slot(&mut self, slot: usize) {
        let Some(entry) = self.pending.entry(slot) else {
            return;
        };
        match self.channel.send(entry.packet()) {
            Ok(()) => {
                self.pending.mark_sent(slot, Instant::now());
                self.sent += 1;
            }
            Err(err) => {
                let dest = entry.packet().destination();
                tracing::warn!(%err, %dest, "failed to send probe");
            }
        }
    }

    fn check_complete(&mut self, now: Instant) {
        if self.reason.is_some() {
            return;
        }
        let answers = self.answered.len();
        if self.unsent.is_empty() && answers >= self.sent {
            self.complete(CompletionReason::AllAnswered);
        } else if self.config.expected_answers > 0 && answers >= self.config.expected_answers {
            self.complete(CompletionReason::ExpectedAnswers);
        } else if now >= self.deadline {
            self.complete(CompletionReason::TimedOut);
        }
    }

    fn complete(&mut self, reason: CompletionReason) {
        if self.reason.is_some() {
            return;
        }
        tracing::debug!(
            ?reason,
            sent = self.sent,
            answered = self.answered.len(),
            "probe session complete"
        );
        self.reason = Some(reason);
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(id) = self.listener_id.take() {
            self.channel.unregister(id);
        }
    }

    fn outcome(&mut self) -> ProbeOutcome {
        ProbeOutcome {
            answered: std::mem::take(&mut self.answered),
            unanswered: self
                .pending
                .entries()
                .filter(|entry| entry.answers() == 0)
                .map(|entry| entry.packet().clone())
                .collect(),
            reason: self.reason.unwrap_or(CompletionReason::TimedOut),
        }
    }
}

impl<S: Socket> PacketListener for ProbeSession<S> {
    fn packet_received(&mut self, packet: &Packet, received_at: Instant) {
        if self.reason.is_some() {
            return;
        }
        if received_at >= self.deadline {
            self.complete(CompletionReason::TimedOut);
            return;
        }
        let Some(inbound) = classify(packet) else {
            return;
        };
        let matched =
            self.pending
                .match_inbound(&inbound, self.config.multi_answer, self.config.match_options);
        for slot in matched {
            if let Some(entry) = self.pending.entry(slot) {
                tracing::trace!(?inbound, sent = ?entry.packet(), "matched answer");
                self.answered.push(Answer {
                    sent: entry.packet().clone(),
                    received: packet.clone(),
                    correlation: inbound.correlation(),
                    sent_at: entry.sent_at().unwrap_or(received_at),
                    received_at,
                });
            }
        }
        self.check_complete(received_at);
    }

    fn next_wakeup(&self) -> Option<Instant> {
        if self.reason.is_some() {
            return None;
        }
        let next_send = self.next_send_at.filter(|_| !self.unsent.is_empty());
        Some(next_send.map_or(self.deadline, |at| at.min(self.deadline)))
    }

    fn on_tick(&mut self, now: Instant) {
        if self.reason.is_none() {
            self.send_due(now);
        }
    }

    fn channel_closed(&mut self) {
        self.listener_id = None;
        self.complete(CompletionReason::ChannelClosed);
    }
}

/// Drives a running [`ProbeSession`].
///
/// Dropping the handle before the session completes abandons it.
pub struct SessionHandle<S: Socket> {
    channel: Rc<Channel<S>>,
    session: Rc<RefCell<ProbeSession<S>>>,
}

impl<S: Socket> SessionHandle<S> {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.session.borrow().reason.is_some()
    }

    /// Poll the channel once on behalf of this session.
    pub fn poll_once(&self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        let polled = self.channel.poll(self.channel.read_timeout());
        self.session.borrow_mut().check_complete(Instant::now());
        polled
    }

    /// Poll until the session completes and return what it collected.
    pub fn wait(self) -> ProbeOutcome {
        while !self.is_complete() {
            if let Err(err) = self.poll_once() {
                tracing::debug!(%err, "probe session interrupted");
                self.session
                    .borrow_mut()
                    .complete(CompletionReason::ChannelClosed);
            }
        }
        self.session.borrow_mut().outcome()
    }
}

impl<S: Socket> Drop for SessionHandle<S> {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_borrow_mut() {
            session.detach();
        }
    }
}
