//! First-fit profile matching.
//!
//! Profiles are tried in declaration order and the first one whose rules can
//! be paired 1:1 with the connected heads wins. Within a profile every rule
//! takes the first unclaimed head its selector accepts. This is deliberately
//! greedy: ambiguous setups resolve by declaration order, never by scoring.

use std::sync::Arc;

use crate::profile::Profile;
use crate::topology::Head;

#[derive(Debug, Clone)]
pub struct Match {
    pub profile: Arc<Profile>,
    /// `assignment[i]` is the index of the rule assigned to `heads[i]`
    pub assignment: Vec<usize>,
}

pub fn find_match<'a, I>(profiles: I, heads: &[Head]) -> Option<Match>
where
    I: IntoIterator<Item = &'a Arc<Profile>>,
{
    profiles.into_iter().find_map(|profile| {
        match_profile(profile, heads).map(|assignment| Match {
            profile: Arc::clone(profile),
            assignment,
        })
    })
}

pub fn match_profile(profile: &Profile, heads: &[Head]) -> Option<Vec<usize>> {
    if profile.outputs.len() != heads.len() {
        return None;
    }

    let mut assignment: Vec<Option<usize>> = vec![None; heads.len()];

    // Wildcards are stored at the end of the list, so those are matched last
    for (rule_index, rule) in profile.outputs.iter().enumerate() {
        let slot = heads
            .iter()
            .enumerate()
            .find(|(i, head)| assignment[*i].is_none() && rule.selector.matches(head))
            .map(|(i, _)| i)?;
        assignment[slot] = Some(rule_index);
    }

    assignment.into_iter().collect()
}
