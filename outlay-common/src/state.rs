//! Profile application state machine.
//!
//! `DaemonState` decides what to do with every topology change and control
//! request: match a profile, submit its transaction, and settle the single
//! outstanding transaction when the compositor answers. It never cancels an
//! in-flight transaction. A request that would need a different one is
//! deferred and handed back to the caller once the outcome is known.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::ControlError;
use crate::executor::CommandRunner;
use crate::matcher::find_match;
use crate::profile::Profile;
use crate::topology::Snapshot;
use crate::transaction::{Outcome, OutputBackend, Transaction};

/// Answer channel of a control-plane caller, carries the applied profile name
pub type Reply = oneshot::Sender<std::result::Result<String, ControlError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Any profile of the configuration
    Auto,
    /// Only profiles with this name
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconfigureStatus {
    Submitted(String),
    AlreadyApplied(String),
    Deferred,
}

/// A request parked until the pending transaction settles
#[derive(Debug)]
pub struct DeferredRequest {
    pub target: Target,
    pub reply: Option<Reply>,
}

#[derive(Debug)]
struct PendingApplication {
    profile: Arc<Profile>,
    serial: u32,
    outcome: oneshot::Receiver<Outcome>,
    reply: Option<Reply>,
}

#[derive(Debug, Default)]
pub struct DaemonState {
    profiles: Vec<Arc<Profile>>,
    current: Option<Arc<Profile>>,
    pending: Option<PendingApplication>,
    deferred: Option<DeferredRequest>,
}

impl DaemonState {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
            ..Self::default()
        }
    }

    pub fn profiles(&self) -> &[Arc<Profile>] {
        &self.profiles
    }

    pub fn current_profile(&self) -> Option<&Arc<Profile>> {
        self.current.as_ref()
    }

    pub fn pending_profile(&self) -> Option<&Arc<Profile>> {
        self.pending.as_ref().map(|pending| &pending.profile)
    }

    /// Swaps in a freshly loaded profile list. Nothing of the new list is
    /// active yet, an in-flight transaction keeps running.
    pub fn replace_profiles(&mut self, profiles: Vec<Profile>) {
        self.profiles = profiles.into_iter().map(Arc::new).collect();
        self.current = None;
    }

    pub fn reconfigure<B: OutputBackend>(
        &mut self,
        snapshot: &Snapshot,
        target: Target,
        backend: &mut B,
        reply: Option<Reply>,
    ) -> Result<ReconfigureStatus, ControlError> {
        let candidates: Vec<&Arc<Profile>> = match &target {
            Target::Auto => self.profiles.iter().collect(),
            Target::Named(name) => {
                let named: Vec<_> = self.profiles.iter().filter(|p| p.name == *name).collect();
                if named.is_empty() {
                    log::warn!("Profile '{}' not found", name);
                    return reject(reply, ControlError::ProfileNotFound(name.clone()));
                }
                named
            }
        };

        let Some(found) = find_match(candidates, &snapshot.heads) else {
            match &target {
                Target::Auto => log::warn!("No profile matched"),
                Target::Named(name) => {
                    log::warn!("Profile '{}' does not match the current outputs", name)
                }
            }
            return reject(reply, ControlError::ProfileNotMatched);
        };
        let name = found.profile.name.clone();

        if let Some(pending) = &self.pending {
            if Arc::ptr_eq(&pending.profile, &found.profile) && pending.serial == snapshot.serial {
                log::debug!("Profile '{}' is already being applied", name);
                return answer(reply, Ok(name)).map(ReconfigureStatus::AlreadyApplied);
            }
            log::info!(
                "Profile '{}' matched while '{}' is still pending, deferring",
                name,
                pending.profile.name
            );
            self.defer(DeferredRequest { target, reply });
            return Ok(ReconfigureStatus::Deferred);
        }

        if let Some(current) = &self.current {
            if Arc::ptr_eq(current, &found.profile) {
                log::debug!("Profile '{}' is already applied", name);
                return answer(reply, Ok(name)).map(ReconfigureStatus::AlreadyApplied);
            }
        }

        log::info!("Applying profile '{}'", name);
        let submitted = Transaction::build(&found.profile, &found.assignment, snapshot)
            .and_then(|transaction| backend.submit(&transaction));
        let outcome = match submitted {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Failed to apply profile '{}': {}", name, e);
                return reject(reply, e.into());
            }
        };

        self.pending = Some(PendingApplication {
            profile: found.profile,
            serial: snapshot.serial,
            outcome,
            reply,
        });
        Ok(ReconfigureStatus::Submitted(name))
    }

    /// Resolves once the pending transaction has an outcome. Never resolves
    /// while nothing is pending.
    pub async fn next_outcome(&mut self) -> Outcome {
        match self.pending.as_mut() {
            Some(pending) => match (&mut pending.outcome).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::warn!("Configuration for profile '{}' vanished", pending.profile.name);
                    Outcome::Failed
                }
            },
            None => std::future::pending().await,
        }
    }

    /// Outcome already delivered for the pending transaction, if any
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        let pending = self.pending.as_mut()?;
        match pending.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => {
                log::warn!("Configuration for profile '{}' vanished", pending.profile.name);
                Some(Outcome::Failed)
            }
        }
    }

    /// Settles the pending transaction. Returns the request deferred behind
    /// it, which the caller should run against the latest snapshot.
    pub fn finish<R: CommandRunner>(&mut self, outcome: Outcome, runner: &mut R) -> Option<DeferredRequest> {
        let Some(pending) = self.pending.take() else {
            log::warn!("Ignoring {:?} outcome, nothing is pending", outcome);
            return self.deferred.take();
        };
        let name = pending.profile.name.clone();

        let result = match outcome {
            Outcome::Succeeded => {
                log::info!("Running commands for profile '{}'", name);
                for command in &pending.profile.commands {
                    runner.run(command);
                }
                log::info!("Configuration for profile '{}' applied", name);
                self.current = Some(pending.profile);
                Ok(name)
            }
            Outcome::Failed => {
                log::error!("Failed to apply configuration for profile '{}'", name);
                Err(ControlError::ProfileNotApplied)
            }
            Outcome::Cancelled => {
                log::warn!("Configuration for profile '{}' cancelled, waiting for a new serial", name);
                Err(ControlError::ProfileNotApplied)
            }
        };

        if let Some(reply) = pending.reply {
            let _ = reply.send(result);
        }
        self.deferred.take()
    }

    fn defer(&mut self, request: DeferredRequest) {
        if let Some(superseded) = self.deferred.replace(request) {
            if let Some(reply) = superseded.reply {
                let _ = reply.send(Err(ControlError::ProfileNotApplied));
            }
        }
    }
}

fn answer(
    reply: Option<Reply>,
    result: std::result::Result<String, ControlError>,
) -> std::result::Result<String, ControlError> {
    if let Some(reply) = reply {
        let _ = reply.send(result.clone());
    }
    result
}

fn reject(reply: Option<Reply>, error: ControlError) -> Result<ReconfigureStatus, ControlError> {
    answer(reply, Err(error)).map(ReconfigureStatus::AlreadyApplied)
}
