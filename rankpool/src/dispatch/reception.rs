//! The three ways of pulling one message off the transport per tick.

use crate::allocator::BufferId;
use crate::config::{CommConfig, ReceptionPolicy};
use crate::error::CommResult;
use crate::message::{Mailbox, Message};
use crate::transport::{ProbeStatus, RequestHandle, Transport};
use crate::types::MessageUnit;

use super::connections::PeerConnections;

/// Reception strategy and the state it keeps between ticks.
#[derive(Debug)]
pub(crate) enum Reception {
    RoundRobin { cursor: usize, one_probe: bool },
    AnySource,
    PersistentRing(PersistentRing),
}

impl Reception {
    pub(crate) fn new<T: Transport + ?Sized>(
        config: &CommConfig,
        transport: &mut T,
    ) -> CommResult<Self> {
        Ok(match config.reception {
            ReceptionPolicy::RoundRobin => Reception::RoundRobin {
                cursor: 0,
                one_probe: config.one_probe_per_tick,
            },
            ReceptionPolicy::AnySource => Reception::AnySource,
            ReceptionPolicy::PersistentRing => Reception::PersistentRing(PersistentRing::new(
                transport,
                transport.size(),
                config.max_message_units(),
            )?),
        })
    }

    pub(crate) fn policy(&self) -> ReceptionPolicy {
        match self {
            Reception::RoundRobin { .. } => ReceptionPolicy::RoundRobin,
            Reception::AnySource => ReceptionPolicy::AnySource,
            Reception::PersistentRing(_) => ReceptionPolicy::PersistentRing,
        }
    }

    /// Point the round-robin cursor back at the first connection.
    pub(crate) fn reset_cursor(&mut self) {
        if let Reception::RoundRobin { cursor, .. } = self {
            *cursor = 0;
        }
    }

    /// Read at most one message into `inbox`.
    pub(crate) fn receive<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        connections: &PeerConnections,
        inbox: &mut Mailbox,
    ) -> CommResult<Option<Message>> {
        if inbox.is_full() {
            return Ok(None);
        }
        match self {
            Reception::RoundRobin { cursor, one_probe } => {
                let attempts = if *one_probe { 1 } else { connections.len() };
                for _ in 0..attempts {
                    let Some(source) = connections.get(*cursor) else {
                        return Ok(None);
                    };
                    *cursor = (*cursor + 1) % connections.len();
                    if let Some(status) = transport.iprobe(Some(source))? {
                        return read_probed(transport, &status, inbox).map(Some);
                    }
                }
                Ok(None)
            }
            Reception::AnySource => match transport.iprobe(None)? {
                Some(status) => read_probed(transport, &status, inbox).map(Some),
                None => Ok(None),
            },
            Reception::PersistentRing(ring) => ring.poll(transport, inbox),
        }
    }

    /// Release transport resources held between ticks.
    pub(crate) fn shutdown<T: Transport + ?Sized>(self, transport: &mut T) -> CommResult<()> {
        if let Reception::PersistentRing(ring) = self {
            ring.cancel(transport)?;
        }
        Ok(())
    }
}

fn read_probed<T: Transport + ?Sized>(
    transport: &mut T,
    status: &ProbeStatus,
    inbox: &mut Mailbox,
) -> CommResult<Message> {
    let destination = transport.rank();
    if status.count == 0 {
        transport.recv(status, &mut [])?;
        let message = Message::empty(status.tag, status.source, destination);
        inbox.push(message)?;
        return Ok(message);
    }

    let (_, allocator) = inbox.parts_mut();
    let buffer = allocator.allocate(status.count)?;
    let count = transport.recv(status, allocator.units_mut(buffer)?)?;
    let message = Message::new(buffer, count, status.tag, status.source, destination);
    inbox.push(message)?;
    Ok(message)
}

/// Fixed ring of pre-posted receives consumed head first.
#[derive(Debug)]
pub(crate) struct PersistentRing {
    requests: Vec<RequestHandle>,
    buffers: Vec<Box<[MessageUnit]>>,
    head: usize,
}

impl PersistentRing {
    fn new<T: Transport + ?Sized>(
        transport: &mut T,
        slots: usize,
        capacity: usize,
    ) -> CommResult<Self> {
        let slots = slots.max(1);
        let mut requests = Vec::with_capacity(slots);
        for _ in 0..slots {
            let request = transport.recv_init(capacity)?;
            transport.start(&request)?;
            requests.push(request);
        }
        tracing::debug!(
            "rank {}: posted {} persistent receives of {} units",
            transport.rank(),
            slots,
            capacity
        );
        Ok(Self {
            requests,
            buffers: (0..slots)
                .map(|_| vec![0; capacity].into_boxed_slice())
                .collect(),
            head: 0,
        })
    }

    /// Number of pre-posted receives.
    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    fn poll<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        inbox: &mut Mailbox,
    ) -> CommResult<Option<Message>> {
        let head = self.head;
        let Some(status) = transport.test_persistent(&self.requests[head], &mut self.buffers[head])?
        else {
            return Ok(None);
        };

        let destination = transport.rank();
        let message = if status.count == 0 {
            Message::empty(status.tag, status.source, destination)
        } else {
            let buffer = copy_into(inbox, &self.buffers[head][..status.count])?;
            Message::new(buffer, status.count, status.tag, status.source, destination)
        };
        inbox.push(message)?;

        transport.start(&self.requests[head])?;
        self.head = (head + 1) % self.requests.len();
        Ok(Some(message))
    }

    fn cancel<T: Transport + ?Sized>(self, transport: &mut T) -> CommResult<()> {
        for request in self.requests {
            transport.cancel(request)?;
        }
        Ok(())
    }
}

fn copy_into(inbox: &mut Mailbox, units: &[MessageUnit]) -> CommResult<BufferId> {
    let buffer = inbox.allocate(units.len())?;
    inbox.allocator_mut().units_mut(buffer)?[..units.len()].copy_from_slice(units);
    Ok(buffer)
}
