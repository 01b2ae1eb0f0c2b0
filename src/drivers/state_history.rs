//! Time-indexed history of abstract device states
//!
//! A device keeps the state it planned for each instant so a late resolve can
//! be diffed against the state that was authoritative just before it.

use std::collections::BTreeMap;

use crate::clock::Time;

#[derive(Debug, Clone)]
pub struct StateHistory<S> {
    states: BTreeMap<Time, S>,
}

impl<S> Default for StateHistory<S> {
    fn default() -> Self {
        Self {
            states: BTreeMap::new(),
        }
    }
}

impl<S> StateHistory<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest state at or before `time`
    pub fn get_state(&self, time: Time) -> Option<(Time, &S)> {
        self.states.range(..=time).next_back().map(|(t, s)| (*t, s))
    }

    /// Latest state strictly before `time`
    pub fn get_state_before(&self, time: Time) -> Option<(Time, &S)> {
        self.states.range(..time).next_back().map(|(t, s)| (*t, s))
    }

    /// States strictly after `time`, ascending
    pub fn states_after(&self, time: Time) -> impl Iterator<Item = (Time, &S)> {
        self.states
            .range((std::ops::Bound::Excluded(time), std::ops::Bound::Unbounded))
            .map(|(t, s)| (*t, s))
    }

    /// Record `state` as authoritative from `time` on
    pub fn set_state(&mut self, state: S, time: Time) {
        self.states.insert(time, state);
    }

    /// Forget states planned at or after `time`
    pub fn remove_from(&mut self, time: Time) {
        self.states.split_off(&time);
    }

    /// Forget states superseded before `now`, keeping the one authoritative at `now`
    pub fn prune_before(&mut self, now: Time) {
        if let Some((current, _)) = self.get_state(now) {
            self.states = self.states.split_off(&current);
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> StateHistory<&'static str> {
        let mut h = StateHistory::new();
        h.set_state("a", 100);
        h.set_state("b", 200);
        h.set_state("c", 300);
        h
    }

    #[test]
    fn test_lookups() {
        let h = history();
        assert_eq!(h.get_state(200), Some((200, &"b")));
        assert_eq!(h.get_state_before(200), Some((100, &"a")));
        assert_eq!(h.get_state(50), None);
        assert_eq!(h.get_state_before(100), None);
        let after: Vec<_> = h.states_after(100).map(|(t, _)| t).collect();
        assert_eq!(after, vec![200, 300]);
    }

    #[test]
    fn test_remove_from() {
        let mut h = history();
        h.remove_from(200);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get_state(1000), Some((100, &"a")));
    }

    #[test]
    fn test_prune_keeps_current() {
        let mut h = history();
        h.prune_before(250);
        assert_eq!(h.len(), 2);
        assert_eq!(h.get_state(250), Some((200, &"b")));
        assert_eq!(h.get_state_before(200), None);

        h.prune_before(50);
        assert_eq!(h.len(), 2);
    }
}
