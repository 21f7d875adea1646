use serde::Deserialize;

/// Traffic pattern run between rank pairs `(2k, 2k + 1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioKind {
    /// Even rank puts, odd rank puts back once it lands, `rounds` times.
    PingPong { rounds: u32, bytes: usize },
    /// Even rank issues `transfers` puts at once, overrunning the slot table.
    Burst { transfers: u32, bytes: usize },
}

impl ScenarioKind {
    pub fn bytes(&self) -> usize {
        match *self {
            ScenarioKind::PingPong { bytes, .. } | ScenarioKind::Burst { bytes, .. } => bytes,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::PingPong { .. } => "pingpong",
            ScenarioKind::Burst { .. } => "burst",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_toml() {
        let kind: ScenarioKind =
            toml::from_str("kind = \"burst\"\ntransfers = 40\nbytes = 64\n").unwrap();
        assert_eq!(
            kind,
            ScenarioKind::Burst {
                transfers: 40,
                bytes: 64
            }
        );
        assert_eq!(kind.bytes(), 64);
        assert_eq!(kind.name(), "burst");
    }
}
