#[cfg(test)]
mod tests {
    use scribble_analyzer::analyzer::cfsm::{ActionLabel, Cfsm};
    use scribble_analyzer::analyzer::safety::{
        CfsmSystem, SafetyVerdict, StepLabel, TypingContext, apply_tau_closure, check_safety,
        enabled_steps,
    };
    use scribble_analyzer::analyzer::{analyze, verify};
    use scribble_analyzer::config::{AnalyzerConfig, SafetyPropertyKind};
    use scribble_analyzer::protocol::ast::Role;

    const OAUTH: &str = include_str!("../demos/oauth.scr");

    fn machines_for(source: &str, config: &AnalyzerConfig) -> CfsmSystem {
        analyze(source, None, config).expect("pipeline passes").machines
    }

    fn config_with(property: SafetyPropertyKind) -> AnalyzerConfig {
        let mut config = AnalyzerConfig::default();
        config.safety_property = property;
        config
    }

    #[test]
    fn test_oauth_asymmetric_choice_is_basic_safe() {
        let config = config_with(SafetyPropertyKind::Basic);
        let machines = machines_for(OAUTH, &config);
        let verdict = check_safety(&machines, &config);
        assert!(verdict.is_safe(), "basic safety accepts asymmetric choice: {verdict:?}");
    }

    #[test]
    fn test_oauth_is_rejected_by_classical_consistency() {
        let config = config_with(SafetyPropertyKind::Consistency);
        let machines = machines_for(OAUTH, &config);
        match check_safety(&machines, &config) {
            SafetyVerdict::Unsafe { violation, .. } => {
                assert_eq!(violation.rule, "duality");
            }
            SafetyVerdict::Safe { .. } => panic!("duality must reject asymmetric choice"),
        }
    }

    #[test]
    fn test_oauth_reaches_terminal_in_both_branches() {
        // Role a's commitment state offers a receive next to a silent
        // alternative; both sub-branches still reach a terminal Γ, because
        // the silent prefix only commits together with an observable and
        // never strands a in the login branch when s cancels. Liveness
        // therefore holds, and with it deadlock freedom.
        let config = config_with(SafetyPropertyKind::Live);
        let machines = machines_for(OAUTH, &config);
        let verdict = check_safety(&machines, &config);
        assert!(
            verdict.is_safe(),
            "every reachable configuration can terminate: {verdict:?}"
        );
        let deadlock_free = config_with(SafetyPropertyKind::DeadlockFree);
        assert!(check_safety(&machines, &deadlock_free).is_safe());
    }

    #[test]
    fn test_wellformedness_implies_basic_safety() {
        // P8 over a spread of well-formed protocols.
        let sources = [
            "global protocol P(role A, role B) { A -> B: Ping(); B -> A: Pong(); }",
            include_str!("../demos/two_phase_commit.scr"),
            r#"
global protocol Nego(role Buyer, role Seller) {
    rec Haggle {
        Buyer -> Seller: Offer(Int);
        choice at Seller {
            Seller -> Buyer: Accept();
        } or {
            Seller -> Buyer: Counter(Int);
            continue Haggle;
        }
    }
}
            "#,
        ];
        let config = AnalyzerConfig::default();
        for source in sources {
            let analysis = analyze(source, None, &config).expect("pipeline passes");
            assert!(analysis.wellformed.holds(), "precondition for P8");
            let verdict = check_safety(&analysis.machines, &config);
            assert!(verdict.is_safe(), "well-formed implies safe: {verdict:?}");
        }
    }

    #[test]
    fn test_mismatched_system_yields_shortest_witness() {
        // Hand-built mismatch: A sends X but B only ever receives Y.
        let mut system = CfsmSystem::new();
        let mut a = Cfsm::new(Role::new("A"));
        let a1 = a.add_state(None);
        a.add_transition(
            a.initial,
            ActionLabel::Send {
                peer: Role::new("B"),
                label: "X".to_string(),
            },
            a1,
        );
        a.mark_terminal(a1);
        let mut b = Cfsm::new(Role::new("B"));
        let b1 = b.add_state(None);
        b.add_transition(
            b.initial,
            ActionLabel::Receive {
                peer: Role::new("A"),
                label: "Y".to_string(),
            },
            b1,
        );
        b.mark_terminal(b1);
        system.insert(Role::new("A"), a);
        system.insert(Role::new("B"), b);

        let config = AnalyzerConfig::default();
        match check_safety(&system, &config) {
            SafetyVerdict::Unsafe {
                violation, trace, ..
            } => {
                assert_eq!(violation.rule, "S-\u{2295}&");
                assert!(trace.is_empty(), "the violation is visible at the initial Γ");
                match violation.offender {
                    Some(StepLabel::Send { ref label, .. }) => assert_eq!(label, "X"),
                    ref other => panic!("expected the offending send, got {other:?}"),
                }
            }
            SafetyVerdict::Safe { .. } => panic!("mismatch must be unsafe"),
        }
    }

    #[test]
    fn test_checker_terminates_on_recursive_protocols() {
        // P7: finite machines with a finite buffer bound terminate even
        // though the protocol itself never does.
        let source = r#"
global protocol Forever(role A, role B) {
    rec L {
        A -> B: Tick();
        B -> A: Tock();
        continue L;
    }
}
        "#;
        let mut config = AnalyzerConfig::default();
        config.buffer_bound = 4;
        let machines = machines_for(source, &config);
        let verdict = check_safety(&machines, &config);
        assert!(verdict.is_safe(), "{verdict:?}");
    }

    #[test]
    fn test_deadlock_freedom_flags_a_genuine_deadlock() {
        // Both roles wait for the other to send first.
        let mut system = CfsmSystem::new();
        for (name, peer) in [("A", "B"), ("B", "A")] {
            let mut cfsm = Cfsm::new(Role::new(name));
            let q1 = cfsm.add_state(None);
            let q2 = cfsm.add_state(None);
            cfsm.add_transition(
                cfsm.initial,
                ActionLabel::Receive {
                    peer: Role::new(peer),
                    label: "Go".to_string(),
                },
                q1,
            );
            cfsm.add_transition(
                q1,
                ActionLabel::Send {
                    peer: Role::new(peer),
                    label: "Go".to_string(),
                },
                q2,
            );
            cfsm.mark_terminal(q2);
            system.insert(Role::new(name), cfsm);
        }
        let config = config_with(SafetyPropertyKind::DeadlockFree);
        match check_safety(&system, &config) {
            SafetyVerdict::Unsafe { violation, .. } => assert_eq!(violation.rule, "stuck"),
            SafetyVerdict::Safe { .. } => panic!("cross-waiting roles deadlock"),
        }
        // Basic safety does not look for stuckness.
        let basic = config_with(SafetyPropertyKind::Basic);
        assert!(check_safety(&system, &basic).is_safe());
    }

    #[test]
    fn test_tau_closure_keeps_observable_enabled_set() {
        // P5 on real machines: closing Γ0 of the OAuth projection changes
        // no role's weakly enabled observables.
        let config = AnalyzerConfig::default();
        let machines = machines_for(OAUTH, &config);
        let initial = TypingContext::initial(&machines);
        let closed = apply_tau_closure(&machines, initial.clone());

        let observables = |ctx: &TypingContext| -> Vec<String> {
            enabled_steps(&machines, ctx, config.buffer_bound)
                .into_iter()
                .filter(|(label, _)| !matches!(label, StepLabel::Tau { .. }))
                .map(|(label, _)| label.to_string())
                .collect()
        };
        assert_eq!(observables(&initial), observables(&closed));
    }
}
