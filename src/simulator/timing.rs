//! Per-node timing state during a simulation.
//!
//! A node moves through queued, started, in progress (has an estimate) and
//! completed. Reading a later phase than the node has reached is an
//! invariant error.

use std::collections::BTreeMap;

use crate::error::SimulationError;
use crate::graph::DependencyGraph;
use crate::simulator::tcp_connection::ConnectionTiming;
use crate::types::{Milliseconds, NodeIndex};

/// Phase a node has reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimingPhase {
    Queued,
    Started,
    InProgress,
    Completed,
}

impl TimingPhase {
    fn describe(self) -> &'static str {
        match self {
            TimingPhase::Queued => "queued",
            TimingPhase::Started => "started",
            TimingPhase::InProgress => "in progress",
            TimingPhase::Completed => "completed",
        }
    }
}

/// Accumulated timing of one node, in simulation milliseconds.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeTimingState {
    pub phase: TimingPhase,
    pub queued_time: Milliseconds,
    pub start_time: Milliseconds,
    pub time_elapsed: Milliseconds,
    pub bytes_downloaded: f64,
    pub estimated_time_elapsed: Milliseconds,
    pub end_time: Milliseconds,
    pub connection_timing: Option<ConnectionTiming>,
    is_network: bool,
}

/// Progress of an in-flight download.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NetworkProgress {
    pub time_elapsed: Milliseconds,
    pub bytes_downloaded: f64,
}

/// Timing state of every node touched by a simulation.
#[derive(Clone, Debug)]
pub struct SimulatorTimingMap {
    labels: Vec<String>,
    is_network: Vec<bool>,
    timings: BTreeMap<NodeIndex, NodeTimingState>,
}

impl SimulatorTimingMap {
    pub fn new(graph: &DependencyGraph) -> Self {
        Self {
            labels: graph.nodes().map(|(_, n)| n.id.clone()).collect(),
            is_network: graph.nodes().map(|(_, n)| n.is_network()).collect(),
            timings: BTreeMap::new(),
        }
    }

    fn invalid(&self, index: NodeIndex, expected: &'static str) -> SimulationError {
        SimulationError::InvalidTimingState {
            node_id: self.labels.get(index.index()).cloned().unwrap_or_else(|| index.to_string()),
            expected,
        }
    }

    fn at_least(&self, index: NodeIndex, phase: TimingPhase) -> Result<&NodeTimingState, SimulationError> {
        match self.timings.get(&index) {
            Some(t) if t.phase >= phase => Ok(t),
            _ => Err(self.invalid(index, phase.describe())),
        }
    }

    fn at_least_mut(&mut self, index: NodeIndex, phase: TimingPhase) -> Result<&mut NodeTimingState, SimulationError> {
        let err = self.invalid(index, phase.describe());
        match self.timings.get_mut(&index) {
            Some(t) if t.phase >= phase => Ok(t),
            _ => Err(err),
        }
    }

    /// Nodes with any timing, in index order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.timings.keys().copied()
    }

    pub fn set_ready_to_start(&mut self, index: NodeIndex, queued_time: Milliseconds) {
        let is_network = self.is_network.get(index.index()).copied().unwrap_or(false);
        self.timings.insert(
            index,
            NodeTimingState {
                phase: TimingPhase::Queued,
                queued_time,
                start_time: 0.0,
                time_elapsed: 0.0,
                bytes_downloaded: 0.0,
                estimated_time_elapsed: 0.0,
                end_time: 0.0,
                connection_timing: None,
                is_network,
            },
        );
    }

    pub fn set_in_progress(&mut self, index: NodeIndex, start_time: Milliseconds) -> Result<(), SimulationError> {
        let timing = self.at_least_mut(index, TimingPhase::Queued)?;
        timing.phase = TimingPhase::Started;
        timing.start_time = start_time;
        timing.time_elapsed = 0.0;
        timing.bytes_downloaded = 0.0;
        Ok(())
    }

    pub fn set_completed(
        &mut self,
        index: NodeIndex,
        end_time: Milliseconds,
        connection_timing: Option<ConnectionTiming>,
    ) -> Result<(), SimulationError> {
        let timing = self.at_least_mut(index, TimingPhase::InProgress)?;
        timing.phase = TimingPhase::Completed;
        timing.end_time = end_time;
        timing.connection_timing = connection_timing;
        Ok(())
    }

    pub fn set_cpu(&mut self, index: NodeIndex, time_elapsed: Milliseconds) -> Result<(), SimulationError> {
        self.cpu_started_mut(index)?.time_elapsed = time_elapsed;
        Ok(())
    }

    pub fn set_cpu_estimated(&mut self, index: NodeIndex, estimated: Milliseconds) -> Result<(), SimulationError> {
        let timing = self.cpu_started_mut(index)?;
        timing.estimated_time_elapsed = estimated;
        timing.phase = timing.phase.max(TimingPhase::InProgress);
        Ok(())
    }

    pub fn set_network(&mut self, index: NodeIndex, progress: NetworkProgress) -> Result<(), SimulationError> {
        let timing = self.network_started_mut(index)?;
        timing.time_elapsed = progress.time_elapsed;
        timing.bytes_downloaded = progress.bytes_downloaded;
        Ok(())
    }

    pub fn set_network_estimated(&mut self, index: NodeIndex, estimated: Milliseconds) -> Result<(), SimulationError> {
        let timing = self.network_started_mut(index)?;
        timing.estimated_time_elapsed = estimated;
        timing.phase = timing.phase.max(TimingPhase::InProgress);
        Ok(())
    }

    fn cpu_started_mut(&mut self, index: NodeIndex) -> Result<&mut NodeTimingState, SimulationError> {
        let err = self.invalid(index, "a started cpu node");
        match self.at_least_mut(index, TimingPhase::Started)? {
            t if !t.is_network => Ok(t),
            _ => Err(err),
        }
    }

    fn network_started_mut(&mut self, index: NodeIndex) -> Result<&mut NodeTimingState, SimulationError> {
        let err = self.invalid(index, "a started network node");
        match self.at_least_mut(index, TimingPhase::Started)? {
            t if t.is_network => Ok(t),
            _ => Err(err),
        }
    }

    pub fn get_queued(&self, index: NodeIndex) -> Result<&NodeTimingState, SimulationError> {
        self.at_least(index, TimingPhase::Queued)
    }

    pub fn get_cpu_started(&self, index: NodeIndex) -> Result<&NodeTimingState, SimulationError> {
        match self.at_least(index, TimingPhase::Started)? {
            t if !t.is_network => Ok(t),
            _ => Err(self.invalid(index, "a started cpu node")),
        }
    }

    pub fn get_network_started(&self, index: NodeIndex) -> Result<&NodeTimingState, SimulationError> {
        match self.at_least(index, TimingPhase::Started)? {
            t if t.is_network => Ok(t),
            _ => Err(self.invalid(index, "a started network node")),
        }
    }

    pub fn get_in_progress(&self, index: NodeIndex) -> Result<&NodeTimingState, SimulationError> {
        self.at_least(index, TimingPhase::InProgress)
    }

    pub fn get_completed(&self, index: NodeIndex) -> Result<&NodeTimingState, SimulationError> {
        self.at_least(index, TimingPhase::Completed)
    }
}
