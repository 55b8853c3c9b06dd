use leaktrace_core::event::{AccessEvent, AccessKind, AddressRange, StackRange};
use leaktrace_core::source::{AccessSource, EventStream, RunParams, SourceError};
use log::{debug, trace};
use std::sync::atomic::{AtomicU64, Ordering};

/// Synthetic execution of the target.
///
/// Events are listed in program order. The script is filtered through the address window of
/// the target when it is started, exactly like an instrumentation engine would.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Script {
    events: Vec<AccessEvent>,
    output: Vec<u8>,
    crash_after: Option<usize>,
}

impl Script {
    /// Creates an empty execution that prints `output`.
    pub fn new(output: impl Into<Vec<u8>>) -> Self {
        Script {
            events: vec![],
            output: output.into(),
            crash_after: None,
        }
    }

    /// Appends a read of `size` bytes at `address` by the instruction at `pc`.
    pub fn read(self, pc: u64, address: u64, size: u32, data: u128) -> Self {
        self.access(AccessKind::Read, pc, address, size, data)
    }

    /// Appends a write of `size` bytes at `address` by the instruction at `pc`.
    pub fn write(self, pc: u64, address: u64, size: u32, data: u128) -> Self {
        self.access(AccessKind::Write, pc, address, size, data)
    }

    /// Appends an arbitrary event. Its stack range is replaced by the one of the target.
    pub fn event(mut self, event: AccessEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Makes the target crash after delivering `events` in-window events.
    pub fn crash_after(mut self, events: usize) -> Self {
        self.crash_after = Some(events);
        self
    }

    fn access(self, kind: AccessKind, pc: u64, address: u64, size: u32, data: u128) -> Self {
        self.event(AccessEvent {
            kind,
            pc,
            address,
            size,
            data,
            stack: StackRange::EMPTY,
        })
    }
}

/// Access source replaying [`Script`]s.
///
/// The script of every run is built by a closure from the run parameters. Returning an error
/// from the closure simulates a failed launch.
pub struct ScriptedSource<F> {
    script: F,
    launches: AtomicU64,
}

impl<F> ScriptedSource<F> {
    /// Creates a new scripted source.
    pub fn new(script: F) -> Self
    where
        F: Fn(&RunParams<'_>) -> Result<Script, SourceError> + Send + Sync,
    {
        ScriptedSource {
            script,
            launches: AtomicU64::new(0),
        }
    }

    /// Number of calls to [`start`](AccessSource::start) so far, including failed ones.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }
}

impl<F> AccessSource for ScriptedSource<F>
where
    F: Fn(&RunParams<'_>) -> Result<Script, SourceError> + Send + Sync,
{
    fn start<'a>(
        &'a self,
        params: &RunParams<'_>,
    ) -> Result<Box<dyn EventStream + 'a>, SourceError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let script = (self.script)(params)?;
        debug!(
            "Replaying run {} with {} scripted events",
            params.run,
            script.events.len()
        );
        Ok(Box::new(Replay::new(
            script,
            params.target.range,
            params.target.stack,
        )))
    }
}

struct Replay {
    events: std::vec::IntoIter<AccessEvent>,
    output: Vec<u8>,
    crash_after: Option<usize>,
    delivered: usize,
    crashed: bool,
}

impl Replay {
    fn new(script: Script, range: AddressRange, stack: StackRange) -> Self {
        let events: Vec<_> = script
            .events
            .into_iter()
            .filter(|e| {
                let inside = range.contains(e.pc);
                if !inside {
                    trace!("Dropping access at pc {:#x} outside {}", e.pc, range);
                }
                inside
            })
            .map(|e| AccessEvent { stack, ..e })
            .collect();
        Replay {
            events: events.into_iter(),
            output: script.output,
            crash_after: script.crash_after,
            delivered: 0,
            crashed: false,
        }
    }

    fn crash(&self) -> SourceError {
        SourceError::TargetCrash(format!("scripted crash after {} events", self.delivered))
    }
}

impl Iterator for Replay {
    type Item = Result<AccessEvent, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.crashed {
            return None;
        }
        if self.crash_after == Some(self.delivered) {
            self.crashed = true;
            return Some(Err(self.crash()));
        }
        let event = self.events.next()?;
        self.delivered += 1;
        Some(Ok(event))
    }
}

impl EventStream for Replay {
    fn finish(self: Box<Self>) -> Result<Vec<u8>, SourceError> {
        match self.crash_after {
            Some(_) => Err(self.crash()),
            None => Ok(self.output),
        }
    }
}
