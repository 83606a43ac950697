use serde::{Deserialize, Serialize};

/// How simulators resolve branch and internal-choice points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChoiceStrategy {
    /// Always take the first enabled edge, in construction order.
    #[default]
    Deterministic,
    /// Uniform pick, reproducible through `random_seed`.
    Random,
    /// The caller supplies picks up front; missing picks fall back to the
    /// first enabled edge.
    UserPicked,
}

/// Which safety predicate the checker decides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SafetyPropertyKind {
    /// Send-receive matching under weak-transition semantics.
    #[default]
    Basic,
    DeadlockFree,
    Live,
    LivePlus,
    /// Classical consistency by duality. Strictly stronger than `Basic`;
    /// rejects asymmetric choice.
    Consistency,
}

/// Knobs shared by the whole pipeline. `Default` gives the documented
/// defaults; callers tweak fields directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub choice_strategy: ChoiceStrategy,
    /// Upper bound on simulator steps; exhaustion is reported, not fatal.
    pub max_steps: u32,
    /// Hard per-channel queue bound. The checker treats an over-bound send
    /// as disabled; the async simulator fails the step.
    pub buffer_bound: u32,
    /// Maximum sub-protocol nesting depth.
    pub call_stack_max: u32,
    /// Whether simulators collect the full event trace.
    pub record_trace: bool,
    pub safety_property: SafetyPropertyKind,
    /// Seed for the random strategy; `None` derives one from entropy.
    pub random_seed: Option<u64>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            choice_strategy: ChoiceStrategy::Deterministic,
            max_steps: 1000,
            buffer_bound: 16,
            call_stack_max: 64,
            record_trace: true,
            safety_property: SafetyPropertyKind::Basic,
            random_seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documentation() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.max_steps, 1000);
        assert_eq!(config.buffer_bound, 16);
        assert_eq!(config.call_stack_max, 64);
        assert!(config.record_trace);
        assert_eq!(config.choice_strategy, ChoiceStrategy::Deterministic);
        assert_eq!(config.safety_property, SafetyPropertyKind::Basic);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let mut config = AnalyzerConfig::default();
        config.choice_strategy = ChoiceStrategy::Random;
        config.random_seed = Some(7);
        let text = serde_json::to_string(&config).unwrap();
        let back: AnalyzerConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
        assert!(text.contains("\"random\""));
    }
}
