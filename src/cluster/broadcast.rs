//! Client-side fan-out of agent messages to every worker slot.
//!
//! Each slot moves through [`SlotState`]: agents are dispatched lazily on
//! the first broadcast, a dispatch that fails with anything but a disconnect
//! is retried on the next one, and a disconnected slot is skipped for the
//! rest of the session. Every round is bounded by one deadline; slots that
//! miss it contribute `None`.

use std::{iter, time::Duration};

use futures::future::join_all;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    agent::{AgentMessage, AgentResponse, AgentTemplate, PrepareAction},
    config::ClusterConfig,
    contact::{AgentContact, Link},
    error::{Error, Result},
    handle::{ClusterDataHandle, SessionSetup},
    ranges::DataRanges,
    scene::SceneFragment,
    table::ClusterTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    NotSent,
    /// Dispatch in flight.
    Sent,
    Active,
    Disconnected,
    Done,
}

/// Per-slot transform strides; 1 is full resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionVector(Vec<u32>);

impl ResolutionVector {
    /// Full resolution on `workers` slots.
    pub fn full(workers: usize) -> Self {
        Self(vec![1; workers])
    }

    /// Rejects strides below 1.
    pub fn new(strides: Vec<i64>) -> Result<Self> {
        strides
            .into_iter()
            .map(|s| {
                if s < 1 {
                    Err(Error::InvalidResolution(s))
                } else {
                    u32::try_from(s).map_err(|_| Error::InvalidResolution(s))
                }
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn strides(&self) -> &[u32] {
        &self.0
    }

    /// The strides to use for `workers` slots. A vector of the wrong length
    /// means full resolution everywhere.
    pub fn for_workers(&self, workers: usize) -> Vec<u32> {
        if self.0.len() == workers {
            self.0.clone()
        } else {
            vec![1; workers]
        }
    }
}

/// Result of relaying one message to one slot.
#[derive(Debug)]
pub enum Outcome {
    Response(AgentResponse),
    TimedOut,
    Failed(Error),
    /// No contact or no message for this slot.
    Skipped,
}

/// Relays messages to a set of contacts concurrently under one deadline.
#[derive(Debug, Clone, Copy)]
pub struct Focus {
    deadline: Duration,
}

impl Focus {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// One outcome per contact, in slot order. Missing messages count as
    /// `None`; surplus ones are dropped.
    pub async fn relay(
        &self,
        contacts: &[Option<AgentContact>],
        messages: Vec<Option<AgentMessage>>,
    ) -> Vec<Outcome> {
        if messages.len() != contacts.len() {
            warn!(
                messages = messages.len(),
                slots = contacts.len(),
                "message count does not match the slots"
            );
        }
        let deadline = self.deadline;
        let messages = messages.into_iter().chain(iter::repeat(None));
        let sends = contacts.iter().zip(messages).map(|(contact, message)| async move {
            let (Some(contact), Some(message)) = (contact, message) else {
                return Outcome::Skipped;
            };
            match tokio::time::timeout(deadline, contact.send(message)).await {
                Ok(Ok(response)) => Outcome::Response(response),
                Ok(Err(e)) => Outcome::Failed(e),
                Err(_) => Outcome::TimedOut,
            }
        });
        join_all(sends).await
    }
}

/// Owns the agents of one client-side renderer and runs broadcast rounds.
pub struct BroadcastCoordinator {
    table: ClusterTable<Link>,
    template: AgentTemplate,
    config: ClusterConfig,
    session: [u8; 16],
    setup: Option<SessionSetup>,
    /// Whether the fallback slot's node holds the current setup.
    fallback_ready: bool,
    states: Vec<SlotState>,
    contacts: Vec<Option<AgentContact>>,
    focus: Focus,
    diagnostics: Vec<String>,
}

impl BroadcastCoordinator {
    /// A coordinator for the workers of a set-up, partitioned client handle.
    /// Each node is handed the handle's setup before its agent.
    pub fn new(
        handle: &ClusterDataHandle<Link>,
        template: AgentTemplate,
        config: ClusterConfig,
    ) -> Result<Self> {
        let table = handle
            .table()
            .ok_or_else(|| Error::config("handle is not set up"))?;
        if handle.partition().is_none() {
            Err(Error::config("handle has no partition to distribute over"))?
        }
        let mut coordinator = Self::with_table(table.clone(), handle.workers(), template, config)?;
        coordinator.setup = handle.session_setup(|link| link.location().to_owned());
        Ok(coordinator)
    }

    pub fn with_table(
        table: ClusterTable<Link>,
        workers: usize,
        template: AgentTemplate,
        config: ClusterConfig,
    ) -> Result<Self> {
        table.check_fits(workers)?;
        Ok(Self {
            table,
            template,
            focus: Focus::new(config.timeout),
            config,
            session: rand::random(),
            setup: None,
            fallback_ready: false,
            states: vec![SlotState::NotSent; workers],
            contacts: vec![None; workers],
            diagnostics: Vec::new(),
        })
    }

    pub fn workers(&self) -> usize {
        self.states.len()
    }

    pub fn states(&self) -> &[SlotState] {
        &self.states
    }

    pub fn active(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == SlotState::Active)
            .count()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn take_diagnostics(&mut self) -> Vec<String> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Dispatches agents to every slot still in `NotSent`; returns the
    /// number of active slots afterwards.
    pub async fn ensure_dispatched(&mut self) -> usize {
        self.publish_fallback().await;
        let pending: Vec<usize> = (0..self.workers())
            .filter(|&slot| self.states[slot] == SlotState::NotSent)
            .collect();
        if pending.is_empty() {
            return self.active();
        }
        for &slot in &pending {
            self.states[slot] = SlotState::Sent;
        }

        let deadline = self.focus.deadline();
        let setup = self.setup.as_ref();
        let dispatches = pending.iter().map(|&slot| {
            let link = self.table.get(slot).cloned();
            let agent = self
                .template
                .instantiate(&self.session, slot as u32, deadline);
            let location = link
                .as_ref()
                .map(|l| l.location().to_owned())
                .unwrap_or_default();
            let span = debug_span!("agent", slot, location = %location);
            async move {
                let Some(link) = link else {
                    return (slot, Err(Error::config(format!("no endpoint for slot {}", slot))));
                };
                let result = async {
                    if let Some(setup) = setup {
                        link.setup(setup.clone()).await?;
                    }
                    debug!(id = %agent.id, "dispatching");
                    link.dispatch(agent).await
                };
                let result = match tokio::time::timeout(deadline, result).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(deadline)),
                };
                (slot, result)
            }
            .instrument(span)
        });

        for (slot, result) in join_all(dispatches).await {
            match result {
                Ok(contact) => {
                    self.states[slot] = SlotState::Active;
                    self.contacts[slot] = Some(contact);
                }
                Err(e) if e.is_disconnect() => {
                    warn!(slot, error = %e, "node unreachable, dropping slot");
                    self.states[slot] = SlotState::Disconnected;
                }
                Err(e) => {
                    warn!(slot, error = %e, "dispatch failed, will retry");
                    self.diagnostics.push(format!("slot {}: {}", slot, e));
                    self.states[slot] = SlotState::NotSent;
                }
            }
        }
        self.active()
    }

    /// Sends `messages[n]` to slot `n`, gathering one optional response per
    /// slot. A disconnect, reported or detected, retires the slot.
    pub async fn broadcast(
        &mut self,
        messages: Vec<Option<AgentMessage>>,
    ) -> Vec<Option<AgentResponse>> {
        self.ensure_dispatched().await;
        let op = messages
            .iter()
            .flatten()
            .next()
            .map_or("none", AgentMessage::op);
        let contacts: Vec<Option<AgentContact>> = self
            .states
            .iter()
            .zip(&self.contacts)
            .map(|(state, contact)| match state {
                SlotState::Active => contact.clone(),
                _ => None,
            })
            .collect();

        let span = debug_span!("broadcast", op);
        let outcomes = self
            .focus
            .relay(&contacts, messages)
            .instrument(span)
            .await;

        outcomes
            .into_iter()
            .enumerate()
            .map(|(slot, outcome)| match outcome {
                Outcome::Response(AgentResponse::Disconnected(reason)) => {
                    self.retire(slot, &reason);
                    None
                }
                Outcome::Response(response) => Some(response),
                Outcome::TimedOut => {
                    warn!(slot, op, deadline = ?self.focus.deadline(), "no response in time");
                    None
                }
                Outcome::Failed(e) if e.is_disconnect() => {
                    self.retire(slot, &e.to_string());
                    None
                }
                Outcome::Failed(e) => {
                    warn!(slot, op, error = %e, "agent call failed");
                    self.diagnostics.push(format!("slot {}: {}", slot, e));
                    None
                }
                Outcome::Skipped => None,
            })
            .collect()
    }

    /// Sends `message` to every slot.
    pub async fn broadcast_all(&mut self, message: AgentMessage) -> Vec<Option<AgentResponse>> {
        let messages = vec![Some(message); self.workers()];
        self.broadcast(messages).await
    }

    pub async fn prepare_action(&mut self, action: PrepareAction) -> Vec<Option<AgentResponse>> {
        self.broadcast_all(AgentMessage::PrepareAction(action)).await
    }

    /// Raw transform responses, one per slot.
    pub async fn transform_responses(
        &mut self,
        resolutions: &ResolutionVector,
    ) -> Vec<Option<AgentResponse>> {
        let messages = resolutions
            .for_workers(self.workers())
            .into_iter()
            .map(|resolution| Some(AgentMessage::Transform { resolution }))
            .collect();
        self.broadcast(messages).await
    }

    /// One fragment per slot; `None` where a slot timed out, failed, had
    /// nothing new or delivered to a callback.
    pub async fn do_transform(
        &mut self,
        resolutions: &ResolutionVector,
    ) -> Vec<Option<SceneFragment>> {
        let responses = self.transform_responses(resolutions).await;
        responses
            .into_iter()
            .enumerate()
            .map(|(slot, response)| match response {
                Some(AgentResponse::Fragment(fragment)) => Some(fragment),
                Some(AgentResponse::Infeasible(reason)) => {
                    self.diagnostics.push(format!("slot {}: {}", slot, reason));
                    None
                }
                _ => None,
            })
            .collect()
    }

    /// Union of every slot's data ranges, `None` if no slot answered.
    pub async fn compute_ranges(&mut self) -> Option<DataRanges> {
        let responses = self.broadcast_all(AgentMessage::ComputeRanges).await;
        DataRanges::merge_all(responses.into_iter().map(|r| match r {
            Some(AgentResponse::Ranges(ranges)) => Some(ranges),
            _ => None,
        }))
    }

    /// The data behind the agents changed: stop them and re-dispatch on the
    /// next round.
    pub async fn invalidate(&mut self) {
        self.stop_active().await;
        for (state, contact) in self.states.iter_mut().zip(&mut self.contacts) {
            if matches!(state, SlotState::Active | SlotState::Sent) {
                *state = SlotState::NotSent;
                *contact = None;
            }
        }
        debug!("agents invalidated");
    }

    /// Stops every agent; the coordinator does nothing afterwards.
    pub async fn shutdown(&mut self) {
        self.stop_active().await;
        for (state, contact) in self.states.iter_mut().zip(&mut self.contacts) {
            if *state != SlotState::Disconnected {
                *state = SlotState::Done;
            }
            *contact = None;
        }
        debug!("session shut down");
    }

    async fn stop_active(&mut self) {
        let messages = self
            .states
            .iter()
            .map(|s| (*s == SlotState::Active).then_some(AgentMessage::Stop))
            .collect();
        let contacts = self.contacts.clone();
        let outcomes = self.focus.relay(&contacts, messages).await;
        for (slot, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Outcome::Failed(e) if e.is_disconnect() => self.retire(slot, &e.to_string()),
                Outcome::Failed(e) => warn!(slot, error = %e, "stop failed"),
                Outcome::TimedOut => warn!(slot, "stop timed out"),
                _ => {}
            }
        }
    }

    /// Hands the setup to the client's own node in the fallback slot, once.
    /// It runs no agent, so a failure only costs a diagnostic.
    async fn publish_fallback(&mut self) {
        let Some(setup) = self.setup.clone() else {
            return;
        };
        if self.fallback_ready {
            return;
        }
        let link = self.table.fallback().clone();
        let deadline = self.focus.deadline();
        match tokio::time::timeout(deadline, link.setup(setup)).await {
            Ok(Ok(())) => self.fallback_ready = true,
            Ok(Err(e)) if e.is_disconnect() => {
                warn!(location = %link.location(), error = %e, "fallback node unreachable");
                self.fallback_ready = true;
            }
            Ok(Err(e)) => {
                warn!(location = %link.location(), error = %e, "fallback setup failed, will retry");
                self.diagnostics.push(format!("fallback: {}", e));
            }
            Err(_) => {
                warn!(location = %link.location(), ?deadline, "fallback setup timed out");
            }
        }
    }

    fn retire(&mut self, slot: usize, reason: &str) {
        warn!(slot, reason, "slot disconnected for the rest of the session");
        self.states[slot] = SlotState::Disconnected;
        self.contacts[slot] = None;
    }
}
