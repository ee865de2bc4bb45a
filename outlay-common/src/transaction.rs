//! Configuration transactions.
//!
//! A [`Transaction`] is the complete configuration sent to the compositor for
//! one profile: every head of the snapshot is either enabled or disabled, the
//! protocol rejects partial configurations.

use tokio::sync::oneshot;

use crate::error::ApplyError;
use crate::profile::{ModeRequest, Position, Profile, ProfileOutputRule, Transform};
use crate::topology::{Head, HeadId, Mode, ModeId, Snapshot};

/// Two refresh rates closer than this (in mHz) are considered equal
pub const REFRESH_TOLERANCE: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelection {
    Existing(ModeId),
    Custom { width: i32, height: i32, refresh: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnabledHead {
    pub head: HeadId,
    pub mode: Option<ModeSelection>,
    pub position: Option<Position>,
    pub scale: Option<f64>,
    pub transform: Option<Transform>,
    pub adaptive_sync: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeadConfig {
    Disable(HeadId),
    Enable(EnabledHead),
}

impl HeadConfig {
    pub fn head(&self) -> HeadId {
        match self {
            HeadConfig::Disable(head) => *head,
            HeadConfig::Enable(enabled) => enabled.head,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub serial: u32,
    pub profile: String,
    pub heads: Vec<HeadConfig>,
}

/// Terminal result of a submitted transaction, delivered exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// The serial went stale before the compositor committed
    Cancelled,
}

/// Hands transactions to the compositor.
///
/// Implementations resolve the returned receiver with the outcome once the
/// compositor answers. Dropping the sender without a value is read as
/// [`Outcome::Failed`].
pub trait OutputBackend {
    fn submit(&mut self, transaction: &Transaction) -> Result<oneshot::Receiver<Outcome>, ApplyError>;
}

impl Transaction {
    pub fn build(profile: &Profile, assignment: &[usize], snapshot: &Snapshot) -> Result<Self, ApplyError> {
        let mut heads = Vec::with_capacity(snapshot.heads.len());

        for (head, rule_index) in snapshot.heads.iter().zip(assignment.iter().copied()) {
            let rule = profile
                .outputs
                .get(rule_index)
                .ok_or_else(|| ApplyError::Unassigned { head: head.name.clone() })?;

            log::info!(
                "Applying profile output '{}' on connected head '{}'",
                rule.selector,
                head.name
            );
            heads.push(configure_head(head, rule)?);
        }

        if heads.len() != snapshot.heads.len() {
            let head = &snapshot.heads[heads.len()];
            return Err(ApplyError::Unassigned { head: head.name.clone() });
        }

        Ok(Self {
            serial: snapshot.serial,
            profile: profile.name.clone(),
            heads,
        })
    }
}

fn configure_head(head: &Head, rule: &ProfileOutputRule) -> Result<HeadConfig, ApplyError> {
    let enabled = rule.enabled.unwrap_or(head.enabled);
    if !enabled {
        return Ok(HeadConfig::Disable(head.id));
    }

    let mode = match rule.mode {
        Some(request) => Some(select_mode(head, &request)?),
        None => None,
    };

    Ok(HeadConfig::Enable(EnabledHead {
        head: head.id,
        mode,
        position: rule.position,
        scale: rule.scale,
        transform: rule.transform,
        adaptive_sync: rule.adaptive_sync,
    }))
}

fn select_mode(head: &Head, request: &ModeRequest) -> Result<ModeSelection, ApplyError> {
    if request.custom {
        return Ok(ModeSelection::Custom {
            width: request.width,
            height: request.height,
            refresh: request.refresh.unwrap_or(0),
        });
    }

    let refresh = request.refresh.filter(|refresh| *refresh != 0);
    find_mode(head, request.width, request.height, refresh)
        .map(|mode| ModeSelection::Existing(mode.id))
        .ok_or_else(|| ApplyError::ModeUnavailable {
            head: head.name.clone(),
            width: request.width,
            height: request.height,
            refresh: match refresh {
                Some(refresh) => format!("{}Hz", refresh as f64 / 1000.0),
                None => "any".to_string(),
            },
        })
}

/// Finds the head mode for a resolution. With a refresh rate the first mode
/// within [`REFRESH_TOLERANCE`] wins, otherwise the fastest one.
pub fn find_mode(head: &Head, width: i32, height: i32, refresh: Option<i32>) -> Option<&Mode> {
    let mut candidates = head
        .modes
        .iter()
        .filter(|mode| mode.width == width && mode.height == height);

    match refresh {
        Some(refresh) => candidates.find(|mode| (refresh - mode.refresh).abs() < REFRESH_TOLERANCE),
        // First mode wins on equal refresh
        None => candidates.fold(None, |best: Option<&Mode>, mode| match best {
            Some(best) if best.refresh >= mode.refresh => Some(best),
            _ => Some(mode),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::OutputSelector;
    use crate::topology::{HeadField, ModeField, Topology};

    fn topology_with_modes(modes: &[(i32, i32, i32)]) -> (Topology, HeadId) {
        let mut topology = Topology::new();
        let head = topology.add_head();
        topology.update_head(head, HeadField::Name("DP-1".to_string()));
        topology.update_head(head, HeadField::Enabled(true));
        for (width, height, refresh) in modes {
            let mode = topology.add_mode(head).unwrap();
            topology.update_mode(mode, ModeField::Size { width: *width, height: *height });
            topology.update_mode(mode, ModeField::Refresh(*refresh));
        }
        (topology, head)
    }

    fn rule(criteria: &str) -> ProfileOutputRule {
        ProfileOutputRule::new(OutputSelector::parse(criteria))
    }

    #[test]
    fn test_find_mode_prefers_highest_refresh() {
        let (topology, head) = topology_with_modes(&[(1920, 1080, 60000), (1920, 1080, 59940)]);
        let head = topology.head(head).unwrap();

        let mode = find_mode(head, 1920, 1080, None).unwrap();
        assert_eq!(mode.refresh, 60000);
    }

    #[test]
    fn test_find_mode_highest_refresh_regardless_of_order() {
        let (topology, head) = topology_with_modes(&[(1920, 1080, 59940), (1280, 720, 120000), (1920, 1080, 74973)]);
        let head = topology.head(head).unwrap();

        assert_eq!(find_mode(head, 1920, 1080, None).unwrap().refresh, 74973);
    }

    #[test]
    fn test_find_mode_refresh_tolerance() {
        let (topology, head) = topology_with_modes(&[(1920, 1080, 59940)]);
        let head = topology.head(head).unwrap();
        assert!(find_mode(head, 1920, 1080, Some(59970)).is_some());

        let (topology, head) = topology_with_modes(&[(1920, 1080, 59900)]);
        let head = topology.head(head).unwrap();
        assert!(find_mode(head, 1920, 1080, Some(59970)).is_none());
    }

    #[test]
    fn test_find_mode_first_within_tolerance() {
        let (topology, head) = topology_with_modes(&[(2560, 1440, 59951), (2560, 1440, 59990)]);
        let head = topology.head(head).unwrap();

        assert_eq!(find_mode(head, 2560, 1440, Some(59970)).unwrap().refresh, 59951);
    }

    #[test]
    fn test_find_mode_resolution_mismatch() {
        let (topology, head) = topology_with_modes(&[(1920, 1200, 60000)]);
        let head = topology.head(head).unwrap();
        assert!(find_mode(head, 1920, 1080, None).is_none());
    }

    #[test]
    fn test_build_enables_with_requested_fields() {
        let (topology, head_id) = topology_with_modes(&[(1920, 1080, 60000)]);
        let mut rule = rule("DP-1");
        rule.enabled = Some(true);
        rule.mode = Some(ModeRequest { width: 1920, height: 1080, refresh: None, custom: false });
        rule.position = Some(Position { x: 0, y: 1080 });
        rule.scale = Some(1.25);
        rule.transform = Some(Transform::Rotate90);
        let profile = Profile::new("desk", vec![rule], vec![]);

        let transaction = Transaction::build(&profile, &[0], &topology.snapshot(7)).unwrap();
        assert_eq!(transaction.serial, 7);
        assert_eq!(transaction.profile, "desk");

        let mode_id = topology.head(head_id).unwrap().modes[0].id;
        assert_eq!(
            transaction.heads,
            vec![HeadConfig::Enable(EnabledHead {
                head: head_id,
                mode: Some(ModeSelection::Existing(mode_id)),
                position: Some(Position { x: 0, y: 1080 }),
                scale: Some(1.25),
                transform: Some(Transform::Rotate90),
                adaptive_sync: None,
            })]
        );
    }

    #[test]
    fn test_build_defaults_to_current_enabled_state() {
        let mut topology = Topology::new();
        let on = topology.add_head();
        topology.update_head(on, HeadField::Enabled(true));
        let off = topology.add_head();
        topology.update_head(off, HeadField::Enabled(false));

        let profile = Profile::new("p", vec![rule("*"), rule("*")], vec![]);
        let transaction = Transaction::build(&profile, &[0, 1], &topology.snapshot(1)).unwrap();

        assert!(matches!(transaction.heads[0], HeadConfig::Enable(ref e) if e.head == on && e.mode.is_none()));
        assert_eq!(transaction.heads[1], HeadConfig::Disable(off));
    }

    #[test]
    fn test_build_disables_head() {
        let (topology, head) = topology_with_modes(&[(1920, 1080, 60000)]);
        let mut rule = rule("DP-1");
        rule.enabled = Some(false);
        // Mode is irrelevant for a disabled head
        rule.mode = Some(ModeRequest { width: 640, height: 480, refresh: None, custom: false });
        let profile = Profile::new("off", vec![rule], vec![]);

        let transaction = Transaction::build(&profile, &[0], &topology.snapshot(1)).unwrap();
        assert_eq!(transaction.heads, vec![HeadConfig::Disable(head)]);
    }

    #[test]
    fn test_build_fails_on_unavailable_mode() {
        let (topology, _) = topology_with_modes(&[(1920, 1080, 60000)]);
        let mut rule = rule("DP-1");
        rule.mode = Some(ModeRequest { width: 3840, height: 2160, refresh: Some(60000), custom: false });
        let profile = Profile::new("4k", vec![rule], vec![]);

        let err = Transaction::build(&profile, &[0], &topology.snapshot(1)).unwrap_err();
        assert_eq!(
            err,
            ApplyError::ModeUnavailable {
                head: "DP-1".to_string(),
                width: 3840,
                height: 2160,
                refresh: "60Hz".to_string(),
            }
        );
    }

    #[test]
    fn test_build_zero_refresh_picks_fastest_mode() {
        let (topology, head_id) = topology_with_modes(&[(1920, 1080, 59940), (1920, 1080, 60000)]);
        let mut rule = rule("DP-1");
        rule.mode = Some(ModeRequest { width: 1920, height: 1080, refresh: Some(0), custom: false });
        let profile = Profile::new("any-rate", vec![rule], vec![]);

        let transaction = Transaction::build(&profile, &[0], &topology.snapshot(1)).unwrap();
        let fastest = topology.head(head_id).unwrap().modes[1].id;
        match &transaction.heads[0] {
            HeadConfig::Enable(enabled) => assert_eq!(enabled.mode, Some(ModeSelection::Existing(fastest))),
            other => panic!("unexpected head config {:?}", other),
        }
    }

    #[test]
    fn test_build_custom_mode_skips_lookup() {
        let (topology, _) = topology_with_modes(&[(1920, 1080, 60000)]);
        let mut rule = rule("DP-1");
        rule.mode = Some(ModeRequest { width: 1600, height: 900, refresh: None, custom: true });
        let profile = Profile::new("custom", vec![rule], vec![]);

        let transaction = Transaction::build(&profile, &[0], &topology.snapshot(1)).unwrap();
        match &transaction.heads[0] {
            HeadConfig::Enable(enabled) => assert_eq!(
                enabled.mode,
                Some(ModeSelection::Custom { width: 1600, height: 900, refresh: 0 })
            ),
            other => panic!("unexpected head config {:?}", other),
        }
    }

    #[test]
    fn test_build_rejects_short_assignment() {
        let mut topology = Topology::new();
        topology.add_head();
        let head = topology.add_head();
        topology.update_head(head, HeadField::Name("HDMI-A-1".to_string()));

        let profile = Profile::new("p", vec![rule("*"), rule("*")], vec![]);
        let err = Transaction::build(&profile, &[0], &topology.snapshot(1)).unwrap_err();
        assert_eq!(err, ApplyError::Unassigned { head: "HDMI-A-1".to_string() });
    }
}
