use orchestrate::config::EscalationConfig;
use orchestrate::escalation::{self, EscalationAction, EscalationEngine};
use orchestrate::types::{Strategy, StrategyOutcome};

fn config(strategies: Vec<Strategy>, max_retries: u32) -> EscalationConfig {
    EscalationConfig {
        strategies,
        max_retries,
        interrupt_grace_secs: 30,
        alternate_runner: Some("backup".to_string()),
        reduced_prompt: Some("prompts/reduced.md".to_string()),
    }
}

#[test]
fn full_ladder_ends_in_give_up() {
    let mut engine = EscalationEngine::new(
        "t1",
        config(
            vec![
                Strategy::Notify,
                Strategy::Interrupt,
                Strategy::KillAndRetry,
                Strategy::SwitchAgent,
                Strategy::SimplifyScope,
            ],
            2,
        ),
    );

    assert_eq!(engine.next_action(), EscalationAction::Notify);
    assert!(matches!(engine.next_action(), EscalationAction::Interrupt { .. }));
    assert_eq!(engine.next_action(), EscalationAction::KillAndRetry { attempt: 1 });
    assert_eq!(engine.next_action(), EscalationAction::KillAndRetry { attempt: 2 });
    assert_eq!(
        engine.next_action(),
        EscalationAction::SwitchAgent { runner: "backup".to_string() }
    );
    assert!(matches!(engine.next_action(), EscalationAction::SimplifyScope { .. }));
    assert_eq!(engine.next_action(), EscalationAction::GiveUp { attempts: 6 });
    // Give-up is stable once reached.
    assert_eq!(engine.next_action(), EscalationAction::GiveUp { attempts: 6 });
}

#[test]
fn attempts_accumulate_across_episodes() {
    // Episode 1: notify + retry. Episode 2 (after recovery): no attempts
    // reset, so the bound still holds.
    let mut engine = EscalationEngine::new(
        "t1",
        config(vec![Strategy::Notify, Strategy::KillAndRetry], 1),
    );

    assert_eq!(engine.next_action(), EscalationAction::Notify);
    assert_eq!(engine.next_action(), EscalationAction::KillAndRetry { attempt: 1 });
    engine.note_recovered(Strategy::KillAndRetry);

    assert_eq!(engine.next_action(), EscalationAction::GiveUp { attempts: 2 });
}

#[test]
fn records_track_the_timeline() {
    let mut engine = EscalationEngine::new(
        "t1",
        config(vec![Strategy::Interrupt, Strategy::KillAndRetry], 1),
    );

    engine.next_action();
    engine.note_exhausted(Strategy::Interrupt, "no recovery within grace window");
    engine.next_action();

    let records = engine.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].strategy, Strategy::Interrupt);
    assert_eq!(records[0].outcome, StrategyOutcome::Exhausted);
    assert_eq!(
        records[0].detail.as_deref(),
        Some("no recovery within grace window")
    );
    assert_eq!(records[1].strategy, Strategy::KillAndRetry);
    assert_eq!(records[1].outcome, StrategyOutcome::Applied);
    assert!(records.iter().all(|r| r.task_id == "t1"));
}

#[test]
fn handoff_artifact_lands_at_fixed_path() {
    let dir = tempfile::tempdir().unwrap();
    let handoff_dir = dir.path().join("handoff");

    let contents = escalation::build_handoff_markdown(
        "build-core",
        &[],
        "compiling module 7",
        "3 files changed, 40 insertions(+)",
        "ab12cd3 checkpoint progress",
    );
    let path = escalation::write_handoff(&handoff_dir, "build-core", &contents).unwrap();

    assert_eq!(path, handoff_dir.join("build-core.md"));
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("# Handoff: build-core"));
    assert!(written.contains("compiling module 7"));
    assert!(written.contains("3 files changed"));
    assert!(written.contains("checkpoint progress"));
}
