//! Staging area for multi-aggregate commits.
//!
//! A workflow decides commands against several rehydrated aggregates, stages
//! the resulting events here, and commits them through
//! [`CommandDispatcher::commit`](crate::command_dispatcher::CommandDispatcher::commit)
//! as one atomic batch. Each stream is appended with the version it was
//! loaded at, so a concurrent writer to any touched stream fails the whole
//! commit.

use serde::Serialize;

use podledger_core::{Aggregate, DomainError};

use crate::command_dispatcher::{DispatchError, Rehydrated, to_uncommitted};
use crate::event_store::StreamAppend;

#[derive(Debug, Default)]
pub struct UnitOfWork {
    appends: Vec<StreamAppend>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide `command` against `loaded`, apply the resulting events to the
    /// in-memory aggregate and stage them.
    ///
    /// Staging several commands against the same aggregate is allowed; later
    /// commands see the state left by earlier ones.
    pub fn stage<A>(
        &mut self,
        loaded: &mut Rehydrated<A>,
        command: A::Command,
    ) -> Result<Vec<A::Event>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: podledger_events::Event + Serialize,
    {
        let decided = loaded.aggregate.handle(&command)?;
        if decided.is_empty() {
            return Ok(decided);
        }

        for ev in &decided {
            loaded.aggregate.apply(ev);
        }

        let uncommitted = to_uncommitted(loaded.aggregate_id, loaded.aggregate_type, &decided)?;

        match self
            .appends
            .iter_mut()
            .find(|a| a.aggregate_id == loaded.aggregate_id)
        {
            Some(existing) => existing.events.extend(uncommitted),
            None => self.appends.push(StreamAppend {
                aggregate_id: loaded.aggregate_id,
                expected_version: loaded.expected_version(),
                events: uncommitted,
            }),
        }

        Ok(decided)
    }

    pub fn is_empty(&self) -> bool {
        self.appends.iter().all(|a| a.events.is_empty())
    }

    pub fn stream_count(&self) -> usize {
        self.appends.len()
    }

    pub(crate) fn into_batch(self) -> Vec<StreamAppend> {
        self.appends
            .into_iter()
            .filter(|a| !a.events.is_empty())
            .collect()
    }
}
