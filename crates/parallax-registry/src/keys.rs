//! Registry key and channel derivation.

/// Derives the namespaced registry keys and pub/sub channel names.
///
/// All keys share a configured namespace prefix so several fleets (or a
/// test run) can coexist on one registry.
#[derive(Debug, Clone)]
pub struct Keys {
    ns: String,
}

impl Keys {
    /// Creates a key deriver for the given namespace.
    #[must_use]
    pub fn new(ns: impl Into<String>) -> Self {
        Self { ns: ns.into() }
    }

    /// The configured namespace.
    #[must_use]
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Global counters and configuration hash.
    #[must_use]
    pub fn gh(&self) -> String {
        format!("{}:gh", self.ns)
    }

    /// Worker record hash.
    #[must_use]
    pub fn wh(&self) -> String {
        format!("{}:wh", self.ns)
    }

    /// Broker record hash.
    #[must_use]
    pub fn bh(&self) -> String {
        format!("{}:bh", self.ns)
    }

    /// Load-scored broker set for a cluster.
    #[must_use]
    pub fn cz(&self, cluster: &str) -> String {
        format!("{}:cz:{cluster}", self.ns)
    }

    /// Hash-scored broker ring for a cluster.
    #[must_use]
    pub fn bz(&self, cluster: &str) -> String {
        format!("{}:bz:{cluster}", self.ns)
    }

    /// Creation-time-scored worker set owned by a broker.
    #[must_use]
    pub fn wz(&self, broker_id: &str) -> String {
        format!("{}:wz:{broker_id}", self.ns)
    }

    /// Workers awaiting recovery.
    #[must_use]
    pub fn rz(&self) -> String {
        format!("{}:rz", self.ns)
    }

    /// Pub/sub channel prefix (stored in `gh` by the join script).
    #[must_use]
    pub fn ch_prefix(&self) -> String {
        format!("{}:ch", self.ns)
    }

    /// Broadcast channel, a literal channel name ending in `*`.
    #[must_use]
    pub fn broadcast_channel(&self) -> String {
        format!("{}:ch:*", self.ns)
    }

    /// Unicast channel for one broker; carries only liveness probes.
    #[must_use]
    pub fn unicast_channel(&self, broker_id: &str) -> String {
        format!("{}:ch:{broker_id}", self.ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        let keys = Keys::new("test");
        assert_eq!(keys.gh(), "test:gh");
        assert_eq!(keys.wh(), "test:wh");
        assert_eq!(keys.bh(), "test:bh");
        assert_eq!(keys.cz("pvp"), "test:cz:pvp");
        assert_eq!(keys.bz("pvp"), "test:bz:pvp");
        assert_eq!(keys.wz("br01"), "test:wz:br01");
        assert_eq!(keys.rz(), "test:rz");
    }

    #[test]
    fn channel_shapes() {
        let keys = Keys::new("test");
        assert_eq!(keys.ch_prefix(), "test:ch");
        assert_eq!(keys.broadcast_channel(), "test:ch:*");
        assert_eq!(keys.unicast_channel("br01"), "test:ch:br01");
    }
}
