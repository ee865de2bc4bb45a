use std::path::{Path, PathBuf};

use anyhow::Result;
use outlay_common::error::ProtocolError;
use outlay_common::{
    CommandRunner, ControlError, ControlRequest, DaemonState, ErrorReporting, HeadStatus, Outcome, OutputBackend,
    ProcessExecutor, Profile, Reply, Snapshot, StatusReport, Target, Topology,
};
use outlay_config::Config;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::wayland::{OutputClient, OutputEvent};

/// Compositor side of the daemon: mirrored topology plus the events that
/// announce changes to it
pub trait OutputSource: OutputBackend {
    /// Runs the handlers of every event already read
    fn dispatch_pending(&mut self) -> std::result::Result<(), ProtocolError>;
    fn take_events(&mut self) -> Vec<OutputEvent>;
    fn snapshot(&self, serial: u32) -> Snapshot;
    fn topology(&self) -> &Topology;
}

enum Wake {
    Wayland(std::result::Result<(), ProtocolError>),
    Outcome(Outcome),
    Control(Option<ControlRequest>),
    Reload,
    Shutdown,
}

pub struct Daemon<C, R> {
    client: C,
    state: DaemonState,
    runner: R,
    config_path: Option<PathBuf>,
    /// Serial of the last `done`, `None` until the first one arrives
    serial: Option<u32>,
}

impl<C: OutputSource, R: CommandRunner> Daemon<C, R> {
    pub fn new(client: C, runner: R, profiles: Vec<Profile>, config_path: Option<PathBuf>) -> Self {
        Self {
            client,
            state: DaemonState::new(profiles),
            runner,
            config_path,
            serial: None,
        }
    }

    /// Dispatches queued Wayland events. Outcomes delivered in the same batch
    /// are settled before the topology is matched again.
    pub fn process_events(&mut self) -> std::result::Result<(), ProtocolError> {
        self.client.dispatch_pending()?;

        if let Some(outcome) = self.state.try_outcome() {
            self.settle(outcome);
        }

        let (done, finished) = latest_done(&self.client.take_events());
        if finished {
            return Err(ProtocolError::ManagerFinished);
        }
        if let Some(serial) = done {
            self.serial = Some(serial);
            self.reconfigure(Target::Auto, None);
        }

        Ok(())
    }

    fn reconfigure(&mut self, target: Target, reply: Option<Reply>) {
        let Some(serial) = self.serial else {
            log::warn!("Outputs not known yet, can't match a profile");
            if let Some(reply) = reply {
                let _ = reply.send(Err(ControlError::ProfileNotMatched));
            }
            return;
        };

        let snapshot = self.client.snapshot(serial);
        if let Err(e) = self.state.reconfigure(&snapshot, target, &mut self.client, reply) {
            log::debug!("Reconfiguration at serial {} ended with: {}", serial, e);
        }
    }

    pub fn settle(&mut self, outcome: Outcome) {
        if let Some(deferred) = self.state.finish(outcome, &mut self.runner) {
            log::debug!("Re-running deferred request for {:?}", deferred.target);
            self.reconfigure(deferred.target, deferred.reply);
        }
    }

    fn reload(&mut self, reply: Option<Reply>) {
        match load_profiles(self.config_path.as_deref()) {
            Ok(profiles) => {
                self.state.replace_profiles(profiles);
                self.reconfigure(Target::Auto, reply);
            }
            Err(e) => {
                e.log_error("Failed to reload configuration");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(ControlError::ConfigNotLoaded(e.user_friendly_message())));
                }
            }
        }
    }

    pub fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Reload { reply } => {
                log::info!("Reloading configuration");
                self.reload(Some(reply));
            }
            ControlRequest::Switch { profile, reply } => {
                log::info!("Switching to profile '{}'", profile);
                self.reconfigure(Target::Named(profile), Some(reply));
            }
            ControlRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> StatusReport {
        StatusReport {
            current_profile: self.state.current_profile().map(|profile| profile.name.clone()),
            pending_profile: self.state.pending_profile().map(|profile| profile.name.clone()),
            heads: self.client.topology().heads().iter().map(HeadStatus::from).collect(),
        }
    }
}

impl Daemon<OutputClient, ProcessExecutor> {
    pub async fn run(&mut self, requests: &mut mpsc::Receiver<ControlRequest>) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            self.process_events()?;
            self.client.flush().await?;

            let wake = tokio::select! {
                result = self.client.read_events() => Wake::Wayland(result),
                outcome = self.state.next_outcome() => Wake::Outcome(outcome),
                request = requests.recv() => Wake::Control(request),
                _ = sighup.recv() => Wake::Reload,
                _ = sigint.recv() => Wake::Shutdown,
                _ = sigterm.recv() => Wake::Shutdown,
            };

            match wake {
                Wake::Wayland(result) => result?,
                Wake::Outcome(outcome) => self.settle(outcome),
                Wake::Control(Some(request)) => self.handle_control(request),
                Wake::Control(None) => anyhow::bail!("IPC server stopped"),
                Wake::Reload => {
                    log::info!("Received SIGHUP, reloading configuration");
                    self.reload(None);
                }
                Wake::Shutdown => {
                    log::info!("Shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub fn stop(&self) {
        self.client.stop();
    }
}

/// Only the newest `done` of a batch matters, earlier serials are stale
fn latest_done(events: &[OutputEvent]) -> (Option<u32>, bool) {
    events.iter().fold((None, false), |(done, finished), event| match event {
        OutputEvent::Done(serial) => (Some(*serial), finished),
        OutputEvent::Finished => (done, true),
    })
}

pub fn load_profiles(path: Option<&Path>) -> outlay_common::Result<Vec<Profile>> {
    let config = Config::load(path)?;
    let profiles = config.into_profiles()?;
    log::info!("{} profiles loaded", profiles.len());
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use outlay_common::error::ApplyError;
    use outlay_common::{HeadField, HeadId, ModeField, OutputSelector, ProfileOutputRule, Transaction};
    use std::fs;
    use tempfile::tempdir;
    use tokio::sync::oneshot;
    use tokio::sync::oneshot::error::TryRecvError;

    #[derive(Default)]
    struct FakeOutputs {
        topology: Topology,
        events: Vec<OutputEvent>,
        submitted: Vec<Transaction>,
        senders: Vec<oneshot::Sender<Outcome>>,
    }

    impl OutputBackend for FakeOutputs {
        fn submit(&mut self, transaction: &Transaction) -> std::result::Result<oneshot::Receiver<Outcome>, ApplyError> {
            let (tx, rx) = oneshot::channel();
            self.submitted.push(transaction.clone());
            self.senders.push(tx);
            Ok(rx)
        }
    }

    impl OutputSource for FakeOutputs {
        fn dispatch_pending(&mut self) -> std::result::Result<(), ProtocolError> {
            Ok(())
        }

        fn take_events(&mut self) -> Vec<OutputEvent> {
            std::mem::take(&mut self.events)
        }

        fn snapshot(&self, serial: u32) -> Snapshot {
            self.topology.snapshot(serial)
        }

        fn topology(&self) -> &Topology {
            &self.topology
        }
    }

    impl FakeOutputs {
        fn resolve(&mut self, outcome: Outcome) {
            self.senders.remove(0).send(outcome).unwrap();
        }

        fn plug(&mut self, name: &str) -> HeadId {
            let head = self.topology.add_head();
            self.topology.update_head(head, HeadField::Name(name.to_string()));
            let mode = self.topology.add_mode(head).unwrap();
            self.topology.update_mode(mode, ModeField::Size { width: 1920, height: 1080 });
            self.topology.update_mode(mode, ModeField::Refresh(60000));
            self.topology.update_head(head, HeadField::Enabled(true));
            self.topology.update_head(head, HeadField::CurrentMode(mode));
            head
        }
    }

    #[derive(Default)]
    struct Recorder {
        commands: Vec<String>,
    }

    impl CommandRunner for Recorder {
        fn run(&mut self, command: &str) {
            self.commands.push(command.to_string());
        }
    }

    fn profile(name: &str, criteria: &[&str], command: &str) -> Profile {
        let rules = criteria
            .iter()
            .map(|criteria| {
                let mut rule = ProfileOutputRule::new(OutputSelector::parse(criteria));
                rule.enabled = Some(true);
                rule
            })
            .collect();
        Profile::new(name, rules, vec![command.to_string()])
    }

    fn laptop_daemon(profiles: Vec<Profile>, config_path: Option<PathBuf>) -> Daemon<FakeOutputs, Recorder> {
        let mut outputs = FakeOutputs::default();
        outputs.plug("eDP-1");
        Daemon::new(outputs, Recorder::default(), profiles, config_path)
    }

    fn switch(daemon: &mut Daemon<FakeOutputs, Recorder>, profile: &str) -> oneshot::Receiver<std::result::Result<String, ControlError>> {
        let (reply, rx) = oneshot::channel();
        daemon.handle_control(ControlRequest::Switch { profile: profile.to_string(), reply });
        rx
    }

    #[test]
    fn test_outcome_in_same_batch_settles_before_done() {
        let mut daemon = laptop_daemon(
            vec![profile("laptop", &["eDP-1"], "notify-send laptop"), profile("mirror", &["eDP-1"], "notify-send mirror")],
            None,
        );
        daemon.client.events.push(OutputEvent::Done(1));
        daemon.process_events().unwrap();
        assert_eq!(daemon.state.pending_profile().unwrap().name, "laptop");

        let mut rx = switch(&mut daemon, "mirror");
        assert_eq!(daemon.client.submitted.len(), 1);

        // The compositor answers and announces a new generation in one read
        daemon.client.resolve(Outcome::Succeeded);
        daemon.client.events.push(OutputEvent::Done(2));
        daemon.process_events().unwrap();

        assert_eq!(daemon.runner.commands, vec!["notify-send laptop"]);
        assert_eq!(daemon.client.submitted.len(), 2);
        assert_eq!(daemon.client.submitted[1].profile, "mirror");
        assert_eq!(daemon.state.pending_profile().unwrap().name, "mirror");
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_deferred_request_runs_after_finish() {
        let mut daemon = laptop_daemon(
            vec![
                profile("docked", &["eDP-1", "DP-1"], "notify-send docked"),
                profile("laptop", &["eDP-1"], "notify-send laptop"),
            ],
            None,
        );
        daemon.client.events.push(OutputEvent::Done(1));
        daemon.process_events().unwrap();
        assert_eq!(daemon.client.submitted[0].profile, "laptop");

        daemon.client.plug("DP-1");
        daemon.client.events.push(OutputEvent::Done(2));
        daemon.process_events().unwrap();
        assert_eq!(daemon.client.submitted.len(), 1);

        daemon.client.resolve(Outcome::Succeeded);
        daemon.process_events().unwrap();

        assert_eq!(daemon.client.submitted.len(), 2);
        assert_eq!(daemon.client.submitted[1].profile, "docked");
        assert_eq!(daemon.client.submitted[1].serial, 2);
        assert_eq!(daemon.state.current_profile().unwrap().name, "laptop");
        assert_eq!(daemon.state.pending_profile().unwrap().name, "docked");
    }

    #[test]
    fn test_invalid_reload_keeps_profiles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[[profile]\nname = ").unwrap();

        let mut daemon = laptop_daemon(vec![profile("laptop", &["eDP-1"], "notify-send laptop")], Some(path));
        daemon.client.events.push(OutputEvent::Done(1));
        daemon.process_events().unwrap();
        daemon.client.resolve(Outcome::Succeeded);
        daemon.process_events().unwrap();

        let (reply, mut rx) = oneshot::channel();
        daemon.handle_control(ControlRequest::Reload { reply });

        assert!(matches!(rx.try_recv(), Ok(Err(ControlError::ConfigNotLoaded(_)))));
        let names: Vec<_> = daemon.state.profiles().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["laptop"]);
        assert_eq!(daemon.state.current_profile().unwrap().name, "laptop");
        assert_eq!(daemon.client.submitted.len(), 1);
    }

    #[test]
    fn test_reload_applies_new_profiles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
            [[profile]]
            name = "solo"
            exec = ["notify-send solo"]

            [[profile.output]]
            criteria = "eDP-1"
            "#,
        )
        .unwrap();

        let mut daemon = laptop_daemon(vec![profile("laptop", &["eDP-1"], "notify-send laptop")], Some(path));
        daemon.client.events.push(OutputEvent::Done(1));
        daemon.process_events().unwrap();
        daemon.client.resolve(Outcome::Succeeded);
        daemon.process_events().unwrap();

        let (reply, mut rx) = oneshot::channel();
        daemon.handle_control(ControlRequest::Reload { reply });
        assert_eq!(daemon.client.submitted[1].profile, "solo");

        daemon.client.resolve(Outcome::Succeeded);
        daemon.process_events().unwrap();
        assert_eq!(rx.try_recv(), Ok(Ok("solo".to_string())));
        assert_eq!(daemon.runner.commands, vec!["notify-send laptop", "notify-send solo"]);
    }

    #[test]
    fn test_control_before_first_done_is_not_matched() {
        let mut daemon = laptop_daemon(vec![profile("laptop", &["eDP-1"], "notify-send laptop")], None);

        let mut rx = switch(&mut daemon, "laptop");

        assert_eq!(rx.try_recv(), Ok(Err(ControlError::ProfileNotMatched)));
        assert!(daemon.client.submitted.is_empty());
        assert!(daemon.state.pending_profile().is_none());
    }

    #[test]
    fn test_finished_manager_stops_processing() {
        let mut daemon = laptop_daemon(vec![], None);
        daemon.client.events.extend([OutputEvent::Done(1), OutputEvent::Finished]);

        assert!(matches!(daemon.process_events(), Err(ProtocolError::ManagerFinished)));
    }

    #[test]
    fn test_status_reports_pending_profile() {
        let mut daemon = laptop_daemon(vec![profile("laptop", &["eDP-1"], "notify-send laptop")], None);
        daemon.client.events.push(OutputEvent::Done(1));
        daemon.process_events().unwrap();

        let report = daemon.status();
        assert_eq!(report.current_profile, None);
        assert_eq!(report.pending_profile.as_deref(), Some("laptop"));
        assert_eq!(report.heads.len(), 1);
        assert_eq!(report.heads[0].name, "eDP-1");
    }

    #[test]
    fn test_latest_done_keeps_newest_serial() {
        let events = [OutputEvent::Done(3), OutputEvent::Done(4)];
        assert_eq!(latest_done(&events), (Some(4), false));
    }

    #[test]
    fn test_latest_done_reports_finished() {
        assert_eq!(latest_done(&[]), (None, false));
        assert_eq!(latest_done(&[OutputEvent::Done(1), OutputEvent::Finished]), (Some(1), true));
    }
}
