//! Property tests for FIFO delivery and parser round-tripping, driven by
//! proptest over random seeds and generated protocol shapes.

use proptest::prelude::*;
use scribble_analyzer::analyzer::parser::parse_source;
use scribble_analyzer::analyzer::simulator::{SimStatus, TraceEventKind, simulate_async};
use scribble_analyzer::analyzer::analyze;
use scribble_analyzer::config::{AnalyzerConfig, ChoiceStrategy};

/// Positions of `needle` items in `haystack`, in order of appearance.
fn arrival_order(trace: &[scribble_analyzer::analyzer::simulator::TraceEvent], from: &str, to: &str) -> Vec<String> {
    trace
        .iter()
        .filter_map(|e| match &e.kind {
            TraceEventKind::Received { from: f, to: t, label }
                if f.as_str() == from && t.as_str() == to =>
            {
                Some(label.clone())
            }
            _ => None,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// P6: whatever the scheduler does, one sender's messages to one
    /// receiver arrive in send order.
    #[test]
    fn fifo_order_holds_under_random_scheduling(seed in any::<u64>()) {
        let source = r#"
global protocol Pipeline(role A, role B, role C) {
    par {
        A -> C: A1();
        A -> C: A2();
        A -> C: A3();
    } and {
        B -> C: B1();
        B -> C: B2();
    }
}
        "#;
        let mut config = AnalyzerConfig::default();
        config.choice_strategy = ChoiceStrategy::Random;
        config.random_seed = Some(seed);
        config.max_steps = 200;
        let analysis = analyze(source, None, &config).expect("pipeline passes");
        let report = simulate_async(&analysis.machines, &config);
        prop_assert_eq!(&report.status, &SimStatus::Complete);

        let from_a = arrival_order(&report.trace, "A", "C");
        prop_assert_eq!(from_a, vec!["A1".to_string(), "A2".to_string(), "A3".to_string()]);
        let from_b = arrival_order(&report.trace, "B", "C");
        prop_assert_eq!(from_b, vec!["B1".to_string(), "B2".to_string()]);
    }

    /// P1: printing a parsed module and re-parsing it is a fixed point.
    #[test]
    fn parser_round_trips_generated_protocols(
        labels in proptest::collection::vec("[A-Z][a-z]{1,6}", 1..6),
        recurse in any::<bool>(),
    ) {
        let mut body = String::new();
        for (i, label) in labels.iter().enumerate() {
            if i % 2 == 0 {
                body.push_str(&format!("    Client -> Server: {label}{i}();\n"));
            } else {
                body.push_str(&format!("    Server -> Client: {label}{i}(Int);\n"));
            }
        }
        let source = if recurse {
            format!(
                "global protocol Generated(role Client, role Server) {{\n    rec Loop {{\n{body}        continue Loop;\n    }}\n}}\n"
            )
        } else {
            format!("global protocol Generated(role Client, role Server) {{\n{body}}}\n")
        };

        let first = parse_source(&source);
        prop_assert!(first.is_clean(), "diagnostics: {:?}", first.diagnostics);
        let printed = first.module.to_string();
        let second = parse_source(&printed);
        prop_assert!(second.is_clean(), "re-parse diagnostics: {:?}", second.diagnostics);
        prop_assert_eq!(printed, second.module.to_string());
    }
}
