//! wlr-output-management client.
//!
//! Mirrors the compositor's heads and modes into a [`Topology`] and submits
//! configurations. Protocol objects never leave this module: the rest of the
//! daemon only sees [`HeadId`]/[`ModeId`] handles.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Mutex;

use tokio::io::unix::AsyncFd;
use tokio::sync::oneshot;
use wayland_client::backend::{ObjectId, WaylandError};
use wayland_client::globals::{registry_queue_init, GlobalListContents};
use wayland_client::protocol::{wl_output, wl_registry};
use wayland_client::{event_created_child, Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols_wlr::output_management::v1::client::{
    zwlr_output_configuration_head_v1::ZwlrOutputConfigurationHeadV1,
    zwlr_output_configuration_v1::{self, ZwlrOutputConfigurationV1},
    zwlr_output_head_v1::{self, ZwlrOutputHeadV1},
    zwlr_output_manager_v1::{self, ZwlrOutputManagerV1},
    zwlr_output_mode_v1::{self, ZwlrOutputModeV1},
};

use outlay_common::error::{ApplyError, ProtocolError};
use outlay_common::{
    HeadConfig, HeadField, HeadId, ModeField, ModeId, ModeSelection, Outcome, OutputBackend, Snapshot, Topology,
    Transaction, Transform,
};

use crate::daemon::OutputSource;

/// `set_adaptive_sync` appeared in version 4
const ADAPTIVE_SYNC_VERSION: u32 = 4;
/// `release` requests appeared in version 3
const RELEASE_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// All heads of a generation have been announced
    Done(u32),
    /// The compositor dropped the output manager
    Finished,
}

#[derive(Default)]
pub struct WaylandState {
    topology: Topology,
    head_ids: HashMap<ObjectId, HeadId>,
    mode_ids: HashMap<ObjectId, ModeId>,
    head_proxies: HashMap<HeadId, ZwlrOutputHeadV1>,
    mode_proxies: HashMap<ModeId, ZwlrOutputModeV1>,
    events: Vec<OutputEvent>,
}

/// Outcome channel of one submitted configuration
pub struct ConfigurationData {
    outcome: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl ConfigurationData {
    fn new(outcome: oneshot::Sender<Outcome>) -> Self {
        Self { outcome: Mutex::new(Some(outcome)) }
    }

    fn resolve(&self, outcome: Outcome) {
        let sender = match self.outcome.lock() {
            Ok(mut sender) => sender.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

pub struct OutputClient {
    connection: Connection,
    queue: EventQueue<WaylandState>,
    qh: QueueHandle<WaylandState>,
    manager: ZwlrOutputManagerV1,
    state: WaylandState,
    fd: AsyncFd<OwnedFd>,
}

impl OutputClient {
    /// Connects to `$WAYLAND_DISPLAY` and binds the output manager. Must be
    /// called from within a tokio runtime.
    pub fn connect() -> Result<Self, ProtocolError> {
        let connection = Connection::connect_to_env()
            .map_err(|e| ProtocolError::Connect { message: e.to_string() })?;

        let (globals, queue) = registry_queue_init::<WaylandState>(&connection)
            .map_err(|e| ProtocolError::Connect { message: e.to_string() })?;
        let qh = queue.handle();

        let manager: ZwlrOutputManagerV1 = globals
            .bind(&qh, 1..=4, ())
            .map_err(|_| ProtocolError::Unsupported)?;
        log::debug!("Bound zwlr_output_manager_v1 version {}", manager.version());

        let fd = connection
            .backend()
            .poll_fd()
            .try_clone_to_owned()
            .and_then(AsyncFd::new)
            .map_err(|e| ProtocolError::Connect { message: e.to_string() })?;

        Ok(Self {
            connection,
            queue,
            qh,
            manager,
            state: WaylandState::default(),
            fd,
        })
    }

    /// Writes queued requests, waiting for the socket while its buffer is full
    pub async fn flush(&self) -> Result<(), ProtocolError> {
        while !flushed(self.connection.flush())? {
            let mut ready = self
                .fd
                .writable()
                .await
                .map_err(|e| ProtocolError::Dispatch { message: e.to_string() })?;
            ready.clear_ready();
        }
        Ok(())
    }

    /// Waits until the socket is readable and reads what arrived. Events are
    /// queued, not dispatched.
    pub async fn read_events(&self) -> Result<(), ProtocolError> {
        let Some(guard) = self.queue.prepare_read() else {
            // Already queued events must be dispatched first
            return Ok(());
        };

        let mut ready = self
            .fd
            .readable()
            .await
            .map_err(|e| ProtocolError::Dispatch { message: e.to_string() })?;

        match guard.read() {
            Ok(_) => Ok(()),
            Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                ready.clear_ready();
                Ok(())
            }
            Err(e) => Err(ProtocolError::Dispatch { message: e.to_string() }),
        }
    }

    pub fn stop(&self) {
        self.manager.stop();
        if let Err(e) = self.connection.flush() {
            log::debug!("Failed to flush on shutdown: {}", e);
        }
    }
}

impl OutputSource for OutputClient {
    fn dispatch_pending(&mut self) -> Result<(), ProtocolError> {
        self.queue
            .dispatch_pending(&mut self.state)
            .map(|_| ())
            .map_err(|e| ProtocolError::Dispatch { message: e.to_string() })
    }

    fn take_events(&mut self) -> Vec<OutputEvent> {
        std::mem::take(&mut self.state.events)
    }

    fn snapshot(&self, serial: u32) -> Snapshot {
        self.state.topology.snapshot(serial)
    }

    fn topology(&self) -> &Topology {
        &self.state.topology
    }
}

/// `Ok(false)` when the socket buffer is full and the flush has to be retried
fn flushed(result: Result<(), WaylandError>) -> Result<bool, ProtocolError> {
    match result {
        Ok(()) => Ok(true),
        Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(ProtocolError::Dispatch { message: e.to_string() }),
    }
}

impl OutputBackend for OutputClient {
    fn submit(&mut self, transaction: &Transaction) -> Result<oneshot::Receiver<Outcome>, ApplyError> {
        // Resolve every handle before any request goes out
        let mut heads = Vec::with_capacity(transaction.heads.len());
        for config in &transaction.heads {
            let head_id = config.head();
            let head = self.state.head_proxies.get(&head_id).ok_or_else(|| ApplyError::UnknownHead {
                head: format!("{:?}", head_id),
            })?;
            let mode = match config {
                HeadConfig::Enable(enabled) => match enabled.mode {
                    Some(ModeSelection::Existing(mode_id)) => Some(
                        self.state
                            .mode_proxies
                            .get(&mode_id)
                            .ok_or_else(|| ApplyError::UnknownMode { head: self.state.head_name(head_id) })?,
                    ),
                    _ => None,
                },
                HeadConfig::Disable(_) => None,
            };
            heads.push((config, head, mode));
        }

        let (tx, rx) = oneshot::channel();
        let configuration =
            self.manager
                .create_configuration(transaction.serial, &self.qh, ConfigurationData::new(tx));

        for (config, head, mode) in heads {
            let enabled = match config {
                HeadConfig::Disable(_) => {
                    configuration.disable_head(head);
                    continue;
                }
                HeadConfig::Enable(enabled) => enabled,
            };

            let config_head = configuration.enable_head(head, &self.qh, ());
            match (enabled.mode, mode) {
                (Some(ModeSelection::Existing(_)), Some(mode)) => config_head.set_mode(mode),
                (Some(ModeSelection::Custom { width, height, refresh }), _) => {
                    config_head.set_custom_mode(width, height, refresh)
                }
                _ => {}
            }
            if let Some(position) = enabled.position {
                config_head.set_position(position.x, position.y);
            }
            if let Some(scale) = enabled.scale {
                config_head.set_scale(scale);
            }
            if let Some(transform) = enabled.transform {
                match wl_output::Transform::try_from(transform.to_raw()) {
                    Ok(transform) => config_head.set_transform(transform),
                    Err(_) => log::warn!("Transform {} has no wire value", transform),
                }
            }
            if let Some(adaptive_sync) = enabled.adaptive_sync {
                if config_head.version() >= ADAPTIVE_SYNC_VERSION {
                    config_head.set_adaptive_sync(if adaptive_sync {
                        zwlr_output_head_v1::AdaptiveSyncState::Enabled
                    } else {
                        zwlr_output_head_v1::AdaptiveSyncState::Disabled
                    });
                } else {
                    log::debug!("Compositor can't set adaptive sync, ignoring");
                }
            }
        }

        configuration.apply();
        log::debug!(
            "Submitted configuration for profile '{}' at serial {}",
            transaction.profile,
            transaction.serial
        );
        Ok(rx)
    }
}

impl WaylandState {
    fn head_id(&self, head: &ZwlrOutputHeadV1) -> Option<HeadId> {
        let id = self.head_ids.get(&head.id()).copied();
        if id.is_none() {
            log::debug!("Event for unknown head {:?}", head.id());
        }
        id
    }

    fn head_name(&self, id: HeadId) -> String {
        self.topology
            .head(id)
            .map(|head| head.name.clone())
            .unwrap_or_else(|| format!("{:?}", id))
    }

    fn update_head(&mut self, head: &ZwlrOutputHeadV1, field: HeadField) {
        if let Some(id) = self.head_id(head) {
            self.topology.update_head(id, field);
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for WaylandState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_registry::WlRegistry,
        _event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // The output manager is bound once, later globals are irrelevant
    }
}

impl Dispatch<ZwlrOutputManagerV1, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _manager: &ZwlrOutputManagerV1,
        event: zwlr_output_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_output_manager_v1::Event::Head { head } => {
                let id = state.topology.add_head();
                log::debug!("New head {:?}", id);
                state.head_ids.insert(head.id(), id);
                state.head_proxies.insert(id, head);
            }
            zwlr_output_manager_v1::Event::Done { serial } => {
                log::debug!("Output configuration done, serial {}", serial);
                state.events.push(OutputEvent::Done(serial));
            }
            zwlr_output_manager_v1::Event::Finished => {
                state.events.push(OutputEvent::Finished);
            }
            _ => {}
        }
    }

    event_created_child!(WaylandState, ZwlrOutputManagerV1, [
        zwlr_output_manager_v1::EVT_HEAD_OPCODE => (ZwlrOutputHeadV1, ()),
    ]);
}

impl Dispatch<ZwlrOutputHeadV1, ()> for WaylandState {
    fn event(
        state: &mut Self,
        head: &ZwlrOutputHeadV1,
        event: zwlr_output_head_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_output_head_v1::Event::Name { name } => state.update_head(head, HeadField::Name(name)),
            zwlr_output_head_v1::Event::Description { description } => {
                state.update_head(head, HeadField::Description(description))
            }
            zwlr_output_head_v1::Event::Make { make } => state.update_head(head, HeadField::Make(make)),
            zwlr_output_head_v1::Event::Model { model } => state.update_head(head, HeadField::Model(model)),
            zwlr_output_head_v1::Event::SerialNumber { serial_number } => {
                state.update_head(head, HeadField::SerialNumber(serial_number))
            }
            zwlr_output_head_v1::Event::PhysicalSize { width, height } => {
                state.update_head(head, HeadField::PhysicalSize { width, height })
            }
            zwlr_output_head_v1::Event::Mode { mode } => {
                let Some(head_id) = state.head_id(head) else {
                    return;
                };
                if let Some(mode_id) = state.topology.add_mode(head_id) {
                    state.mode_ids.insert(mode.id(), mode_id);
                    state.mode_proxies.insert(mode_id, mode);
                }
            }
            zwlr_output_head_v1::Event::Enabled { enabled } => {
                state.update_head(head, HeadField::Enabled(enabled != 0))
            }
            zwlr_output_head_v1::Event::CurrentMode { mode } => match state.mode_ids.get(&mode.id()).copied() {
                Some(mode_id) => state.update_head(head, HeadField::CurrentMode(mode_id)),
                None => log::warn!("Head reported an unknown current mode"),
            },
            zwlr_output_head_v1::Event::Position { x, y } => state.update_head(head, HeadField::Position { x, y }),
            zwlr_output_head_v1::Event::Transform { transform } => {
                let transform = match transform {
                    WEnum::Value(transform) => Transform::from_raw(transform.into()),
                    WEnum::Unknown(raw) => Transform::from_raw(raw),
                };
                match transform {
                    Some(transform) => state.update_head(head, HeadField::Transform(transform)),
                    None => log::warn!("Head reported an invalid transform"),
                }
            }
            zwlr_output_head_v1::Event::Scale { scale } => state.update_head(head, HeadField::Scale(scale)),
            zwlr_output_head_v1::Event::AdaptiveSync { state: adaptive_sync } => {
                let enabled = matches!(adaptive_sync, WEnum::Value(zwlr_output_head_v1::AdaptiveSyncState::Enabled));
                state.update_head(head, HeadField::AdaptiveSync(enabled));
            }
            zwlr_output_head_v1::Event::Finished => {
                if let Some(id) = state.head_ids.remove(&head.id()) {
                    log::debug!("Head {:?} ({}) finished", id, state.head_name(id));
                    state.topology.remove_head(id);
                    state.head_proxies.remove(&id);
                    state.mode_ids.retain(|_, mode_id| state.topology.mode_owner(*mode_id).is_some());
                    state.mode_proxies.retain(|mode_id, _| state.topology.mode_owner(*mode_id).is_some());
                }
                if head.version() >= RELEASE_VERSION {
                    head.release();
                }
            }
            _ => {}
        }
    }

    event_created_child!(WaylandState, ZwlrOutputHeadV1, [
        zwlr_output_head_v1::EVT_MODE_OPCODE => (ZwlrOutputModeV1, ()),
    ]);
}

impl Dispatch<ZwlrOutputModeV1, ()> for WaylandState {
    fn event(
        state: &mut Self,
        mode: &ZwlrOutputModeV1,
        event: zwlr_output_mode_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(id) = state.mode_ids.get(&mode.id()).copied() else {
            if matches!(event, zwlr_output_mode_v1::Event::Finished) && mode.version() >= RELEASE_VERSION {
                mode.release();
            }
            return;
        };

        match event {
            zwlr_output_mode_v1::Event::Size { width, height } => {
                state.topology.update_mode(id, ModeField::Size { width, height })
            }
            zwlr_output_mode_v1::Event::Refresh { refresh } => {
                state.topology.update_mode(id, ModeField::Refresh(refresh))
            }
            zwlr_output_mode_v1::Event::Preferred => state.topology.update_mode(id, ModeField::Preferred),
            zwlr_output_mode_v1::Event::Finished => {
                state.topology.remove_mode(id);
                state.mode_ids.remove(&mode.id());
                state.mode_proxies.remove(&id);
                if mode.version() >= RELEASE_VERSION {
                    mode.release();
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwlrOutputConfigurationV1, ConfigurationData> for WaylandState {
    fn event(
        _state: &mut Self,
        configuration: &ZwlrOutputConfigurationV1,
        event: zwlr_output_configuration_v1::Event,
        data: &ConfigurationData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let outcome = match event {
            zwlr_output_configuration_v1::Event::Succeeded => Outcome::Succeeded,
            zwlr_output_configuration_v1::Event::Failed => Outcome::Failed,
            zwlr_output_configuration_v1::Event::Cancelled => Outcome::Cancelled,
            _ => return,
        };
        log::debug!("Configuration {:?}", outcome);
        data.resolve(outcome);
        configuration.destroy();
    }
}

impl Dispatch<ZwlrOutputConfigurationHeadV1, ()> for WaylandState {
    fn event(
        _state: &mut Self,
        _head: &ZwlrOutputConfigurationHeadV1,
        _event: <ZwlrOutputConfigurationHeadV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_data_resolves_once() {
        let (tx, mut rx) = oneshot::channel();
        let data = ConfigurationData::new(tx);

        data.resolve(Outcome::Cancelled);
        data.resolve(Outcome::Succeeded);

        assert_eq!(rx.try_recv().unwrap(), Outcome::Cancelled);
    }

    #[test]
    fn test_flush_retries_on_full_buffer() {
        let full = WaylandError::Io(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(!flushed(Err(full)).unwrap());
        assert!(flushed(Ok(())).unwrap());

        let broken = WaylandError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(matches!(flushed(Err(broken)), Err(ProtocolError::Dispatch { .. })));
    }

    #[test]
    fn test_transform_wire_values() {
        for transform in Transform::ALL {
            let wire = wl_output::Transform::try_from(transform.to_raw()).unwrap();
            assert_eq!(Transform::from_raw(wire.into()), Some(transform));
        }
    }
}
