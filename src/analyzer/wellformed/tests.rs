#[cfg(test)]
mod tests {
    use crate::analyzer::cfg::build_cfg;
    use crate::analyzer::parser::parse_source;
    use crate::analyzer::wellformed::verify;
    use crate::diagnostics::DiagnosticKind;

    fn verify_source(source: &str) -> crate::analyzer::wellformed::WellFormedness {
        let outcome = parse_source(source);
        assert!(outcome.is_clean(), "parse failed: {:?}", outcome.diagnostics);
        let decl = outcome.module.global_protocols().next().unwrap().clone();
        let cfg = build_cfg(&decl).expect("CFG should build");
        verify(&cfg)
    }

    #[test]
    fn test_ping_pong_is_well_formed() {
        let report = verify_source(
            "protocol PingPong(role A, role B) { A -> B: Ping(); B -> A: Pong(); }",
        );
        assert!(report.holds());
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_unused_role_is_a_warning_not_an_error() {
        let report = verify_source(
            "protocol P(role A, role B, role C) { A -> B: M(); }",
        );
        assert!(report.connected);
        assert!(report.errors.is_empty());
        assert_eq!(report.warnings.len(), 1);
        let warning = &report.warnings[0];
        assert_eq!(warning.kind, DiagnosticKind::UnusedRole);
        assert_eq!(warning.offending_entity.as_deref(), Some("C"));
    }

    #[test]
    fn test_disconnected_role_groups_are_an_error() {
        let report = verify_source(
            r#"
protocol Split(role A, role B, role C, role D) {
    A -> B: M1();
    C -> D: M2();
}
            "#,
        );
        assert!(!report.connected);
        assert!(report
            .errors
            .iter()
            .any(|d| d.kind == DiagnosticKind::DisconnectedRoles));
    }

    #[test]
    fn test_sub_invocation_couples_its_role_arguments() {
        let report = verify_source(
            r#"
protocol Main(role A, role B, role C) {
    A -> B: Start();
    do Child(B, C);
}
            "#,
        );
        assert!(report.connected, "errors: {:?}", report.errors);
    }

    #[test]
    fn test_ambiguous_choice_same_channel_same_label() {
        let report = verify_source(
            r#"
protocol P(role A, role B) {
    choice at A {
        A -> B: M();
        A -> B: Left();
    } or {
        A -> B: M();
        A -> B: Right();
    }
}
            "#,
        );
        assert!(!report.deterministic);
        assert!(report
            .errors
            .iter()
            .any(|d| d.kind == DiagnosticKind::AmbiguousChoice));
    }

    #[test]
    fn test_distinct_labels_on_same_channel_are_deterministic() {
        let report = verify_source(
            r#"
protocol P(role A, role B) {
    choice at A {
        A -> B: Left();
    } or {
        A -> B: Right();
    }
}
            "#,
        );
        assert!(report.deterministic);
    }

    #[test]
    fn test_parallel_race_on_shared_channel() {
        let report = verify_source(
            r#"
protocol P(role A, role B) {
    par {
        A -> B: M1();
    } and {
        A -> B: M2();
    }
}
            "#,
        );
        assert!(!report.race_free);
        let race = report
            .errors
            .iter()
            .find(|d| d.kind == DiagnosticKind::Race)
            .unwrap();
        assert_eq!(race.offending_entity.as_deref(), Some("(A, B)"));
    }

    #[test]
    fn test_disjoint_parallel_channels_are_race_free() {
        let report = verify_source(
            r#"
protocol TwoPhase(role Coord, role P1, role P2) {
    Coord -> P1, P2: Prepare();
    par {
        P1 -> Coord: Vote();
    } and {
        P2 -> Coord: Vote();
    }
}
            "#,
        );
        assert!(report.race_free, "errors: {:?}", report.errors);
        assert!(report.holds());
    }

    #[test]
    fn test_choice_determinism_sees_through_recursion() {
        let report = verify_source(
            r#"
protocol P(role A, role B) {
    choice at A {
        rec L {
            A -> B: Same();
            continue L;
        }
    } or {
        A -> B: Same();
    }
}
            "#,
        );
        assert!(!report.deterministic);
    }
}
