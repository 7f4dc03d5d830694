//! Breakpoint handles returned by [`DebugSession`].
//!
//! The delivery mode is fixed when the breakpoint is set: a
//! [`WaitingBreakpoint`] queues hits for a blocking consumer, a
//! [`CallbackBreakpoint`] runs a callback on the dispatch thread. Dropping
//! either handle leaves the breakpoint planted; call `delete` to remove it.

use std::fmt;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::bus::{receive, ListenerId};
use crate::capability::BreakpointId;
use crate::error::Result;
use crate::event::{Event, EventTag, Source};
use crate::session::DebugSession;

pub(crate) fn matches_breakpoint(
    event: &Event,
    source: Source,
    id: &BreakpointId,
    sigabrt: bool,
) -> bool {
    if event.source != source {
        return false;
    }
    if event.has_tag(EventTag::Breakpoint) {
        return match (id.number, event.properties.bkpt_number) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => event.address() == Some(id.address),
        };
    }
    sigabrt && event.has_tag(EventTag::SigAbrt)
}

pub struct WaitingBreakpoint {
    session: DebugSession,
    id: BreakpointId,
    listener: ListenerId,
    hits: Receiver<Event>,
}

impl WaitingBreakpoint {
    pub(crate) fn new(
        session: DebugSession,
        id: BreakpointId,
        listener: ListenerId,
        hits: Receiver<Event>,
    ) -> Self {
        Self {
            session,
            id,
            listener,
            hits,
        }
    }

    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.id.address
    }

    /// Take the next hit. `None` blocks, `Some(Duration::ZERO)` polls.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Event> {
        receive(&self.hits, timeout)
    }

    pub fn delete(self) -> Result<()> {
        self.session.bus().unregister(self.listener);
        self.session.unplant(&self.id)
    }
}

impl fmt::Debug for WaitingBreakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitingBreakpoint")
            .field("id", &self.id)
            .field("session", &self.session.name())
            .finish()
    }
}

pub struct CallbackBreakpoint {
    session: DebugSession,
    id: BreakpointId,
    listener: ListenerId,
}

impl CallbackBreakpoint {
    pub(crate) fn new(session: DebugSession, id: BreakpointId, listener: ListenerId) -> Self {
        Self {
            session,
            id,
            listener,
        }
    }

    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.id.address
    }

    pub fn delete(self) -> Result<()> {
        self.session.bus().unregister(self.listener);
        self.session.unplant(&self.id)
    }
}

impl fmt::Debug for CallbackBreakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackBreakpoint")
            .field("id", &self.id)
            .field("session", &self.session.name())
            .finish()
    }
}
