//! Assigns ownership of a label's min-ready node slots to exactly one
//! running launcher (spec §5): hash `(label_canonical_name,
//! launcher_hostname)` for every eligible launcher and pick the lowest
//! score. Every scheduler computes the same ring from the same component
//! list, so they agree on the owner without any extra coordination.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use zuul_types::{ComponentKind, ComponentRegistration};

fn score(label: &str, hostname: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    (label, hostname).hash(&mut hasher);
    hasher.finish()
}

/// The launcher that owns `label`'s min-ready slots, or `None` if no
/// launcher is currently running and accepting work.
pub fn owning_launcher<'a>(
    label: &str,
    components: &'a [ComponentRegistration],
) -> Option<&'a ComponentRegistration> {
    components
        .iter()
        .filter(|c| matches!(c.kind, ComponentKind::Launcher) && c.is_eligible_for_work())
        .min_by_key(|c| score(label, &c.hostname))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_types::ComponentState;

    fn launcher(hostname: &str) -> ComponentRegistration {
        let mut reg = ComponentRegistration::new(hostname, ComponentKind::Launcher);
        reg.state = ComponentState::Running;
        reg.accepting_work = true;
        reg
    }

    #[test]
    fn exactly_one_owner_is_chosen_deterministically() {
        let launchers = vec![launcher("a"), launcher("b"), launcher("c")];
        let first = owning_launcher("ubuntu-jammy", &launchers).unwrap();
        let second = owning_launcher("ubuntu-jammy", &launchers).unwrap();
        assert_eq!(first.hostname, second.hostname);
    }

    #[test]
    fn paused_launchers_are_ineligible() {
        let mut paused = launcher("a");
        paused.state = ComponentState::Paused;
        let launchers = vec![paused];
        assert!(owning_launcher("ubuntu-jammy", &launchers).is_none());
    }

    #[test]
    fn different_labels_can_land_on_different_owners() {
        let launchers = vec![launcher("a"), launcher("b")];
        let owners: std::collections::HashSet<_> = (0..50)
            .map(|i| owning_launcher(&format!("label-{i}"), &launchers).unwrap().hostname.clone())
            .collect();
        assert!(owners.len() >= 2, "expected labels to spread across launchers");
    }
}
