use rand::seq::SliceRandom;
use std::collections::HashSet;

use crate::config::OverflowPolicy;

/// Picks the fast-scan focus set
///
/// Held symbols always come first. Remaining slots are filled from the
/// watchlist, either by a rotating cursor (every candidate gets a turn) or
/// by random sampling.
#[derive(Debug)]
pub struct FocusSelector {
    cap: usize,
    policy: OverflowPolicy,
    cursor: usize,
}

impl FocusSelector {
    pub fn new(cap: usize, policy: OverflowPolicy) -> Self {
        Self {
            cap: cap.max(1),
            policy,
            cursor: 0,
        }
    }

    pub fn select(&mut self, held: &[String], watchlist: &[String]) -> Vec<String> {
        let mut focus: Vec<String> = Vec::with_capacity(self.cap);
        let mut seen: HashSet<&str> = HashSet::new();

        for symbol in held {
            if focus.len() == self.cap {
                tracing::warn!(
                    held = held.len(),
                    cap = self.cap,
                    "More held symbols than the fast-scan cap"
                );
                return focus;
            }
            if seen.insert(symbol.as_str()) {
                focus.push(symbol.clone());
            }
        }

        let candidates: Vec<&String> = watchlist
            .iter()
            .filter(|s| seen.insert(s.as_str()))
            .collect();
        let slots = self.cap - focus.len();

        if candidates.len() <= slots {
            focus.extend(candidates.into_iter().cloned());
            return focus;
        }

        match self.policy {
            OverflowPolicy::RoundRobin => {
                let start = self.cursor % candidates.len();
                focus.extend(
                    candidates
                        .iter()
                        .cycle()
                        .skip(start)
                        .take(slots)
                        .map(|s| (*s).clone()),
                );
                self.cursor = (start + slots) % candidates.len();
            }
            OverflowPolicy::Random => {
                let mut rng = rand::thread_rng();
                focus.extend(
                    candidates
                        .choose_multiple(&mut rng, slots)
                        .map(|s| (*s).clone()),
                );
            }
        }

        focus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_under_cap_takes_everything() {
        let mut selector = FocusSelector::new(10, OverflowPolicy::RoundRobin);
        let focus = selector.select(&names(&["HELD"]), &names(&["A", "B", "HELD"]));
        assert_eq!(focus, names(&["HELD", "A", "B"]));
    }

    #[test]
    fn test_held_symbols_take_priority() {
        let mut selector = FocusSelector::new(3, OverflowPolicy::Random);
        let focus = selector.select(&names(&["X", "Y"]), &names(&["A", "B", "C", "D"]));

        assert_eq!(focus.len(), 3);
        assert_eq!(&focus[..2], names(&["X", "Y"]).as_slice());
        assert!(["A", "B", "C", "D"].contains(&focus[2].as_str()));
    }

    #[test]
    fn test_round_robin_visits_every_candidate() {
        let mut selector = FocusSelector::new(2, OverflowPolicy::RoundRobin);
        let watchlist = names(&["A", "B", "C", "D", "E"]);

        let mut visited: Vec<String> = Vec::new();
        for _ in 0..3 {
            visited.extend(selector.select(&[], &watchlist));
        }

        assert_eq!(visited, names(&["A", "B", "C", "D", "E", "A"]));
    }

    #[test]
    fn test_random_sample_is_bounded_and_unique() {
        let mut selector = FocusSelector::new(4, OverflowPolicy::Random);
        let watchlist = names(&["A", "B", "C", "D", "E", "F", "G"]);

        for _ in 0..20 {
            let focus = selector.select(&[], &watchlist);
            let unique: HashSet<&String> = focus.iter().collect();
            assert_eq!(focus.len(), 4);
            assert_eq!(unique.len(), 4);
        }
    }

    #[test]
    fn test_cap_limits_held() {
        let mut selector = FocusSelector::new(2, OverflowPolicy::RoundRobin);
        let focus = selector.select(&names(&["X", "Y", "Z"]), &names(&["A"]));
        assert_eq!(focus, names(&["X", "Y"]));
    }
}
