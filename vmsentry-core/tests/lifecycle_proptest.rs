//! Property tests for status verdicts, archive stamps and command sequences

use proptest::prelude::*;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};
use vmsentry_core::archive::StampGenerator;
use vmsentry_core::instance_config::InstanceConfig;
use vmsentry_core::scenario::{Scenario, ScenarioRunner, Step};
use vmsentry_core::status_check::{evaluate, Outcome, ProbeResult};
use vmsentry_core::HarnessConfig;

proptest! {
    #[test]
    fn ok_response_is_always_success(elapsed in 0u64..1_000, timeout in 0u64..1_000) {
        let outcome = evaluate(
            Some(ProbeResult::OK),
            Duration::from_secs(elapsed),
            Duration::from_secs(timeout),
        );
        prop_assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn other_responses_never_succeed(
        status in prop::option::of(100u16..600),
        elapsed in 0u64..1_000,
        timeout in 1u64..1_000,
    ) {
        prop_assume!(status != Some(200) && status != Some(503));
        let outcome = evaluate(
            status.map(ProbeResult::new),
            Duration::from_secs(elapsed),
            Duration::from_secs(timeout),
        );
        if elapsed >= timeout {
            prop_assert_eq!(outcome, Outcome::Timeout);
        } else {
            prop_assert_eq!(outcome, Outcome::KeepPolling);
        }
    }

    #[test]
    fn unavailable_fails_only_inside_the_window(elapsed in 0u64..100, timeout in 0u64..100) {
        let outcome = evaluate(
            Some(ProbeResult::UNAVAILABLE),
            Duration::from_secs(elapsed),
            Duration::from_secs(timeout),
        );
        let expected = if elapsed < timeout { Outcome::ExplicitFailure } else { Outcome::Timeout };
        prop_assert_eq!(outcome, expected);
    }

    #[test]
    fn stamps_are_strictly_increasing(offsets in prop::collection::vec(0u64..5_000_000, 1..40)) {
        let stamps = StampGenerator::new();
        let base = UNIX_EPOCH + Duration::from_secs(1_704_067_200);
        let generated: Vec<String> = offsets
            .iter()
            .map(|ms| stamps.next(base + Duration::from_millis(*ms)))
            .collect();

        for stamp in &generated {
            prop_assert_eq!(stamp.len(), 14);
            prop_assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        }
        for pair in generated.windows(2) {
            prop_assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cmd {
    Start,
    Status,
    Stop,
    StopUndefine,
    ForceStopUndefine,
}

impl Cmd {
    fn text(self) -> &'static str {
        match self {
            Cmd::Start => "start",
            Cmd::Status => "status",
            Cmd::Stop => "stop",
            Cmd::StopUndefine => "stop-undefine --stop-timeout=5",
            Cmd::ForceStopUndefine => "force-stop-undefine",
        }
    }
}

fn cmd() -> impl Strategy<Value = Cmd> {
    prop_oneof![
        Just(Cmd::Start),
        Just(Cmd::Status),
        Just(Cmd::Stop),
        Just(Cmd::StopUndefine),
        Just(Cmd::ForceStopUndefine),
    ]
}

/// Expected exit codes from a two-flag model of the domain
fn model_steps(commands: &[Cmd], hang: bool) -> Vec<Step> {
    let mut running = false;
    let mut steps = vec![
        Step::StageConfig {
            instance: "vm1".to_string(),
            config: InstanceConfig::new("rhel.img"),
        },
        Step::StageCloudInit {
            instance: "vm1".to_string(),
            address: "10.0.0.9".to_string(),
            netmask: "255.255.255.0".to_string(),
            mac_address: "52:54:00:67:28:80".to_string(),
        },
        Step::HangShutdown {
            instance: "vm1".to_string(),
            hang,
        },
    ];
    for command in commands {
        let expect = match command {
            Cmd::Status if !running => 3,
            _ => 0,
        };
        running = matches!(command, Cmd::Start) || (running && matches!(command, Cmd::Status));
        steps.push(Step::run("vm1", command.text(), expect));
    }
    steps
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_command_sequences_hold_invariants(
        commands in prop::collection::vec(cmd(), 1..14),
        hang in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let scenario = model_steps(&commands, hang)
            .into_iter()
            .fold(Scenario::new("random"), Scenario::step);
        let runner = ScenarioRunner::simulated(
            HarnessConfig::test(Path::new("/tmp/vmsentry-proptest")),
            ["rhel.img"],
        );
        let report = runtime.block_on(runner.run(&scenario));

        prop_assert!(report.passed(), "{:#?}", report.steps);
        prop_assert!(report.violations().is_empty());

        let dir = runtime.block_on(runner.adaptor().directory("vm1")).unwrap();
        let undefined_last = commands
            .iter()
            .rev()
            .find(|c| matches!(c, Cmd::Start | Cmd::StopUndefine | Cmd::ForceStopUndefine))
            .map_or(false, |c| !matches!(c, Cmd::Start));
        if undefined_last {
            prop_assert!(dir.live_files().is_empty());
        }
        if commands.iter().any(|c| matches!(c, Cmd::Start))
            && commands.iter().any(|c| matches!(c, Cmd::StopUndefine | Cmd::ForceStopUndefine))
        {
            let started_then_undefined = commands
                .iter()
                .position(|c| matches!(c, Cmd::Start))
                .zip(commands.iter().rposition(|c| matches!(c, Cmd::StopUndefine | Cmd::ForceStopUndefine)))
                .map_or(false, |(first_start, last_undefine)| first_start < last_undefine);
            if started_then_undefined {
                prop_assert!(dir.has_archive());
            }
        }
    }
}
