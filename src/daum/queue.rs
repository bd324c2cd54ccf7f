//! Outgoing command queue.
//!
//! The cockpit serves a single half duplex channel, so exactly one command
//! may be awaiting its response at any time. The queue is processed on a
//! fixed tick matching the device's inter-command spacing: each tick either
//! pops acknowledged work, retries the command still in flight, or writes
//! the next one. Responses acknowledge commands by their opcode/address
//! header, the only correlation the protocol offers.

use std::collections::VecDeque;

use tracing::{debug, warn};
use uuid::Uuid;

use super::command::{Command, Priority};
use super::BusAddress;
use crate::config::QueueConfig;

/// A command with its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub id: Uuid,
    pub command: Command,
    pub priority: Priority,
    pub retries: u32,
    pub acknowledged: bool,
}

/// What a single tick decided: at most one frame to write, plus any
/// commands that exhausted their retries and were dropped.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub write: Option<Vec<u8>>,
    pub dropped: Vec<Command>,
}

pub struct CommandQueue {
    entries: VecDeque<QueuedCommand>,
    /// Correlation id of the command most recently written to the wire.
    in_flight: Option<Uuid>,
    config: QueueConfig,
}

impl CommandQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            in_flight: None,
            config,
        }
    }

    /// Append a command. When the cap is exceeded the oldest entry is
    /// evicted and returned, so new work is never rejected.
    pub fn enqueue(&mut self, command: Command, priority: Priority) -> Option<Command> {
        self.entries.push_back(QueuedCommand {
            id: Uuid::new_v4(),
            command,
            priority,
            retries: 0,
            acknowledged: false,
        });

        if self.entries.len() > self.config.max_pending {
            let evicted = self.entries.pop_front()?;
            if self.in_flight == Some(evicted.id) {
                self.in_flight = None;
            }
            warn!(
                "queue over capacity, evicting oldest command {:?}",
                evicted.command.opcode
            );
            return Some(evicted.command);
        }
        None
    }

    /// Whether an unacknowledged command with this header is already
    /// queued. Used to suppress duplicate telemetry polls when the cockpit
    /// is slow to answer.
    pub fn has_pending(&self, opcode: u8, address: BusAddress) -> bool {
        self.entries
            .iter()
            .any(|entry| !entry.acknowledged && entry.command.matches_header(opcode, address))
    }

    /// Mark the first matching command as acknowledged. An ack without a
    /// match is noise (the command may already have been dropped), not an
    /// error.
    pub fn acknowledge(&mut self, opcode: u8, address: BusAddress) -> bool {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| !entry.acknowledged && entry.command.matches_header(opcode, address));

        match entry {
            Some(entry) => {
                debug!("acknowledged {:?}", entry.command.opcode);
                entry.acknowledged = true;
                if self.in_flight == Some(entry.id) {
                    self.in_flight = None;
                }
                true
            }
            None => {
                warn!(
                    "response {:02x}/{:02x} matches no queued command",
                    opcode, address
                );
                false
            }
        }
    }

    /// Process one tick.
    pub fn tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        loop {
            // acknowledged heads are done
            while matches!(self.entries.front(), Some(entry) if entry.acknowledged) {
                self.entries.pop_front();
            }

            let Some(head) = self.entries.front_mut() else {
                return outcome;
            };

            // an unacknowledged head we already wrote means the response
            // never came within this tick
            if self.in_flight == Some(head.id) {
                head.retries += match head.priority {
                    Priority::High => self.config.retry_increment_high,
                    Priority::Medium => self.config.retry_increment_medium,
                    Priority::Low => self.config.retry_increment_low,
                };
                if head.retries >= self.config.max_retries {
                    warn!(
                        "dropping {:?} after {} retries",
                        head.command.opcode, head.retries
                    );
                    self.in_flight = None;
                    if let Some(dropped) = self.entries.pop_front() {
                        outcome.dropped.push(dropped.command);
                    }
                    continue;
                }
                debug!(
                    "no ack for {:?}, retry {}",
                    head.command.opcode, head.retries
                );
            }

            self.in_flight = Some(head.id);
            outcome.write = Some(head.command.encode());
            return outcome;
        }
    }

    /// Drop everything, including the in-flight command.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.in_flight = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daum::command::Opcode;

    fn queue() -> CommandQueue {
        CommandQueue::new(QueueConfig::default())
    }

    fn run_data(address: BusAddress) -> Command {
        Command::new(Opcode::RunData, address)
    }

    #[test]
    fn writes_head_once_per_tick() {
        let mut q = queue();
        q.enqueue(Command::with_payload(Opcode::SetGear, 0x07, 1), Priority::High);
        q.enqueue(run_data(0x07), Priority::Low);

        // only the head goes out; the second command waits its turn
        let outcome = q.tick();
        assert_eq!(outcome.write, Some(vec![0x53, 0x07, 0x01]));
        assert!(outcome.dropped.is_empty());
    }

    #[test]
    fn acknowledged_head_makes_way_for_the_next() {
        let mut q = queue();
        q.enqueue(Command::with_payload(Opcode::SetGear, 0x07, 1), Priority::High);
        q.enqueue(run_data(0x07), Priority::Low);

        assert_eq!(q.tick().write, Some(vec![0x53, 0x07, 0x01]));
        assert!(q.acknowledge(0x53, 0x07));

        let outcome = q.tick();
        assert_eq!(outcome.write, Some(vec![0x40, 0x07]));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn every_command_is_acknowledged_or_dropped() {
        let mut q = queue();
        q.enqueue(Command::with_payload(Opcode::SetWatt, 0x07, 30), Priority::High);
        q.enqueue(run_data(0x07), Priority::Low);

        let mut dropped = Vec::new();
        for _ in 0..20 {
            dropped.extend(q.tick().dropped);
        }
        // no acks ever arrive, so both commands end up dropped
        assert_eq!(dropped.len(), 2);
        assert!(q.is_empty());
        assert!(q.tick().write.is_none());
    }

    #[test]
    fn high_priority_retries_up_to_the_bound() {
        let mut q = queue();
        q.enqueue(Command::with_payload(Opcode::SetWatt, 0x07, 30), Priority::High);

        let mut writes = 0;
        let mut dropped = Vec::new();
        for _ in 0..10 {
            let outcome = q.tick();
            if outcome.write.is_some() {
                writes += 1;
            }
            dropped.extend(outcome.dropped);
        }
        // initial write plus retries below the bound of 3
        assert_eq!(writes, 3);
        assert_eq!(dropped.len(), 1);
    }

    #[test]
    fn low_priority_is_exhausted_after_one_missed_tick() {
        let mut q = queue();
        q.enqueue(run_data(0x07), Priority::Low);

        assert!(q.tick().write.is_some());
        // the single missed tick jumps the counter straight to the bound
        let outcome = q.tick();
        assert!(outcome.write.is_none());
        assert_eq!(outcome.dropped.len(), 1);
    }

    #[test]
    fn dropped_head_is_replaced_within_the_same_tick() {
        let mut q = queue();
        q.enqueue(run_data(0x07), Priority::Low);
        q.enqueue(Command::with_payload(Opcode::SetGear, 0x07, 2), Priority::High);

        assert_eq!(q.tick().write, Some(vec![0x40, 0x07]));
        // the stale poll is dropped and the gear command goes out instead
        let outcome = q.tick();
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.write, Some(vec![0x53, 0x07, 0x02]));
    }

    #[test]
    fn pending_duplicate_is_detectable() {
        let mut q = queue();
        for _ in 0..3 {
            q.enqueue(run_data(0x07), Priority::Low);
        }
        assert!(q.has_pending(Opcode::RunData.byte(), 0x07));
        assert!(!q.has_pending(Opcode::RunData.byte(), 0x08));
        assert!(!q.has_pending(Opcode::SetGear.byte(), 0x07));
    }

    #[test]
    fn unmatched_ack_is_a_no_op() {
        let mut q = queue();
        q.enqueue(run_data(0x07), Priority::Low);
        assert!(!q.acknowledge(0x53, 0x07));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn overflow_evicts_the_oldest_entry() {
        let mut q = CommandQueue::new(QueueConfig {
            max_pending: 3,
            ..QueueConfig::default()
        });
        assert!(q.enqueue(run_data(0x07), Priority::Low).is_none());
        assert!(q
            .enqueue(Command::with_payload(Opcode::SetGear, 0x07, 1), Priority::High)
            .is_none());
        assert!(q
            .enqueue(Command::with_payload(Opcode::SetWatt, 0x07, 10), Priority::High)
            .is_none());

        let evicted = q.enqueue(Command::with_payload(Opcode::SetWatt, 0x07, 11), Priority::High);
        assert_eq!(evicted.map(|c| c.opcode), Some(Opcode::RunData));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn clear_empties_the_queue() {
        let mut q = queue();
        q.enqueue(run_data(0x07), Priority::Low);
        q.tick();
        q.clear();
        assert!(q.is_empty());
        assert!(q.tick().write.is_none());
    }
}
