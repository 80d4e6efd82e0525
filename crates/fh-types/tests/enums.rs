use fh_types::{CaseStatus, Severity};

#[test]
fn severity_rank_matches_health_score_weight_order() {
    // spec.md §4.11: critical 18 > high 16 > warning 12 > medium 10 > low 6 > info 4
    assert!(Severity::Info < Severity::Low);
    assert!(Severity::Low < Severity::Medium);
    assert!(Severity::Medium < Severity::Warning);
    assert!(Severity::Warning < Severity::High);
    assert!(Severity::High < Severity::Critical);
}

#[test]
fn severity_collapses_onto_case_scale() {
    assert_eq!(Severity::Info.to_case_scale(), Severity::Low);
    assert_eq!(Severity::Warning.to_case_scale(), Severity::Medium);
    assert_eq!(Severity::High.to_case_scale(), Severity::High);
    assert_eq!(Severity::Critical.to_case_scale(), Severity::Critical);
}

#[test]
fn case_status_transitions_match_spec_graph() {
    assert!(CaseStatus::Open
        .allowed_transitions()
        .contains(&CaseStatus::Escalated));
    assert!(!CaseStatus::Resolved
        .allowed_transitions()
        .contains(&CaseStatus::Monitoring));
    assert_eq!(CaseStatus::Resolved.allowed_transitions(), &[CaseStatus::Reopened]);
}

#[test]
fn signal_id_round_trips_as_plain_string() {
    let id = fh_types::SignalId::new("expense_creep_by_vendor", "abc123");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"expense_creep_by_vendor:abc123\"");
    let back: fh_types::SignalId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}
