use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Per-symbol pause after an order failure
#[derive(Debug, Default)]
pub struct CooldownMap {
    until: HashMap<String, DateTime<Utc>>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause `symbol` for `duration` from `now`
    ///
    /// An existing longer cooldown is kept.
    pub fn install(&mut self, symbol: &str, now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        let resume = now + duration;
        let entry = self.until.entry(symbol.to_string()).or_insert(resume);
        if *entry < resume {
            *entry = resume;
        }
        *entry
    }

    /// Resume time if `symbol` is still cooling down
    ///
    /// Expired entries are removed on lookup.
    pub fn active_until(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.until.get(symbol) {
            Some(&resume) if resume > now => Some(resume),
            Some(_) => {
                self.until.remove(symbol);
                None
            }
            None => None,
        }
    }

    pub fn is_active(&mut self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.active_until(symbol, now).is_some()
    }

    /// Remove expired entries, returning how many were dropped
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.until.len();
        self.until.retain(|_, resume| *resume > now);
        before - self.until.len()
    }

    pub fn len(&self) -> usize {
        self.until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.until.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_expires() {
        let mut cooldowns = CooldownMap::new();
        let now = Utc::now();
        cooldowns.install("SOL_USDT", now, Duration::seconds(300));

        assert!(cooldowns.is_active("SOL_USDT", now + Duration::seconds(299)));
        assert!(!cooldowns.is_active("SOL_USDT", now + Duration::seconds(300)));
        // Expired entry was removed by the lookup
        assert!(cooldowns.is_empty());
    }

    #[test]
    fn test_install_keeps_longer_cooldown() {
        let mut cooldowns = CooldownMap::new();
        let now = Utc::now();
        let first = cooldowns.install("SOL_USDT", now, Duration::seconds(300));
        let second = cooldowns.install("SOL_USDT", now, Duration::seconds(10));

        assert_eq!(first, second);
    }

    #[test]
    fn test_prune() {
        let mut cooldowns = CooldownMap::new();
        let now = Utc::now();
        cooldowns.install("A", now, Duration::seconds(10));
        cooldowns.install("B", now, Duration::seconds(600));

        assert_eq!(cooldowns.prune(now + Duration::seconds(60)), 1);
        assert_eq!(cooldowns.len(), 1);
        assert!(cooldowns.is_active("B", now + Duration::seconds(60)));
    }
}
