//! Domain events handled by the agent's dispatcher.

/// Events are value-typed tags without payload; hardware producers and
/// the RPC surface both feed them into the same bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// No-op, used to initialise metric families at startup.
    Noop,
    /// Request to visually identify this blade.
    Identify,
    /// Operator confirmation clearing identify mode.
    IdentifyConfirm,
    /// Thermal alarm; puts the blade into its protective state.
    Critical,
    /// Clears the critical state.
    CriticalReset,
    /// Physical press of the edge button.
    EdgeButton,
}

impl Event {
    /// Stable label used for metrics and logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Noop => "noop",
            Event::Identify => "identify",
            Event::IdentifyConfirm => "identify_confirm",
            Event::Critical => "critical",
            Event::CriticalReset => "critical_reset",
            Event::EdgeButton => "edge_button",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn event_labels_are_stable() {
        // These strings are part of the metrics contract.
        assert_eq!(Event::Noop.as_str(), "noop");
        assert_eq!(Event::Identify.as_str(), "identify");
        assert_eq!(Event::IdentifyConfirm.as_str(), "identify_confirm");
        assert_eq!(Event::Critical.as_str(), "critical");
        assert_eq!(Event::CriticalReset.as_str(), "critical_reset");
        assert_eq!(Event::EdgeButton.as_str(), "edge_button");
    }

    #[test]
    fn events_compare_by_tag() {
        assert_eq!(Event::Identify, Event::Identify);
        assert_ne!(Event::Identify, Event::IdentifyConfirm);
    }
}
