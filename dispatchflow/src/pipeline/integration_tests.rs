//! Tests for building, validating and running pipelines.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    use crate::action::{Action, ActionBase, Parameters};
    use crate::connection::SharedConnection;
    use crate::context::DataPath;
    use crate::errors::{FailureKind, Result};
    use crate::events::{CollectingEventSink, ACTION_END, ACTION_START};
    use crate::job::{DeviceConfig, TimeoutsConfig};
    use crate::pipeline::{ParentInfo, Pipeline, RetryAction};
    use crate::testing::{
        assert_failed_with, assert_last_result, ActionProbe, CountingDiagnostic, FailingAction,
        FlakyAction, MockConnection, MockProtocol, SlowAction, SucceedingAction, TestJob,
    };
    use crate::timeout::Deadline;

    fn params(value: Value) -> Option<Parameters> {
        match value {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    fn far_deadline() -> Deadline {
        Instant::now() + Duration::from_secs(600)
    }

    /// Leaf relying on every default of the trait.
    #[derive(Debug)]
    struct PlainAction {
        base: ActionBase,
    }

    impl PlainAction {
        fn new(name: &str) -> Self {
            Self {
                base: ActionBase::new(name, "plain", "plain action").with_section("deploy"),
            }
        }
    }

    #[async_trait]
    impl Action for PlainAction {
        fn base(&self) -> &ActionBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ActionBase {
            &mut self.base
        }

        fn kind(&self) -> &'static str {
            "plain"
        }
    }

    #[derive(Debug)]
    struct PanickingAction {
        base: ActionBase,
    }

    #[async_trait]
    impl Action for PanickingAction {
        fn base(&self) -> &ActionBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ActionBase {
            &mut self.base
        }

        fn kind(&self) -> &'static str {
            "panicking"
        }

        async fn run(
            &mut self,
            _connection: Option<SharedConnection>,
            _max_end_time: Deadline,
        ) -> Result<Option<SharedConnection>> {
            panic!("board exploded");
        }
    }

    fn boot_retry(children: Vec<&'static str>) -> RetryAction {
        children.into_iter().fold(
            RetryAction::new("boot-retry", "boot with retries", "retry the boot").with_section("boot"),
            |retry, child| retry.with_child(move || Box::new(SucceedingAction::new(child)) as Box<dyn Action>),
        )
    }

    #[test]
    fn test_levels_and_section_inheritance() {
        let (_job, mut pipeline) = TestJob::new().root();
        pipeline.add_action(Box::new(SucceedingAction::new("deploy-ok")), None).unwrap();
        pipeline
            .add_action(Box::new(boot_retry(vec!["power-on", "wait-prompt"])), None)
            .unwrap();

        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.find("deploy-ok").unwrap().base().level(), "1");
        assert_eq!(pipeline.find("boot-retry").unwrap().base().level(), "2");
        let power = pipeline.find("power-on").unwrap();
        assert_eq!(power.base().level(), "2.1");
        assert_eq!(power.base().section(), "boot");
        assert_eq!(pipeline.find("wait-prompt").unwrap().base().level(), "2.2");

        let child = pipeline.find("boot-retry").unwrap().base().pipeline().unwrap();
        assert!(!child.is_root());
        assert_eq!(
            child.parent(),
            Some(&ParentInfo {
                name: "boot-retry".to_string(),
                level: "2".to_string(),
                section: "boot".to_string(),
            })
        );
    }

    #[test]
    fn test_timeout_priority_through_add_action() {
        let device = DeviceConfig {
            timeouts: TimeoutsConfig {
                action: Some(json!({"seconds": 10})),
                ..TimeoutsConfig::default()
            },
            ..DeviceConfig::default()
        };
        let (_job, mut pipeline) = TestJob::new()
            .with_device(device)
            .with_action_timeout("deploy-ok", 60)
            .root();

        pipeline
            .add_action(
                Box::new(SucceedingAction::new("deploy-ok")),
                params(json!({"timeout": {"seconds": 5}})),
            )
            .unwrap();
        pipeline.add_action(Box::new(SucceedingAction::new("deploy-ok")), None).unwrap();
        pipeline.add_action(Box::new(SucceedingAction::new("boot-ok")), None).unwrap();

        let budgets: Vec<u64> = pipeline
            .actions()
            .iter()
            .map(|action| action.base().timeout().duration().as_secs())
            .collect();
        assert_eq!(budgets, vec![5, 60, 10]);
    }

    #[test]
    fn test_repeat_and_failure_retry_conflict() {
        let (_job, mut pipeline) = TestJob::new().root();
        let err = pipeline
            .add_action(
                Box::new(boot_retry(vec!["power-on"])),
                params(json!({"repeat": 2, "failure_retry": 3})),
            )
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::JobConfig);
        assert!(err.message.contains("repeat and failure_retry"));
    }

    #[test]
    fn test_validation_collects_every_error() {
        let (_job, mut pipeline) = TestJob::new().root();
        pipeline.add_action(Box::new(SucceedingAction::new("bad_name")), None).unwrap();
        pipeline
            .add_action(
                Box::new(RetryAction::new("empty-retry", "retry", "retry nothing").with_section("boot")),
                None,
            )
            .unwrap();

        let result = pipeline.validate_actions();
        assert_failed_with(&result, FailureKind::JobConfig, "Invalid job data");
        let errors = pipeline.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("Use - instead of _"));
        assert!(errors[1].contains("needs to implement an internal pipeline"));
    }

    #[test]
    fn test_valid_pipeline() {
        let (_job, mut pipeline) = TestJob::new().root();
        pipeline.add_action(Box::new(SucceedingAction::new("deploy-ok")), None).unwrap();
        pipeline.add_action(Box::new(boot_retry(vec!["power-on"])), None).unwrap();
        pipeline.validate_actions().unwrap();
        assert!(pipeline.errors().is_empty());
    }

    #[tokio::test]
    async fn test_connection_threading() {
        let (_job, mut pipeline) = TestJob::new().root();
        let probe = ActionProbe::new();
        let serial: SharedConnection = MockConnection::new("serial");
        pipeline
            .add_action(Box::new(SucceedingAction::new("connect").returning(serial)), None)
            .unwrap();
        pipeline
            .add_action(Box::new(SucceedingAction::new("use-it").with_probe(Arc::clone(&probe))), None)
            .unwrap();

        let connection = pipeline.run_actions(None, far_deadline()).await.unwrap();
        assert_eq!(connection.unwrap().name(), "serial");
        assert_eq!(probe.run_connections(), vec![Some("serial".to_string())]);
        assert_eq!(pipeline.last_connection().unwrap().name(), "serial");
    }

    #[tokio::test]
    async fn test_failed_action_is_cleaned_with_connection_in_effect() {
        let (_job, mut pipeline) = TestJob::new().root();
        let first = ActionProbe::new();
        let failing = ActionProbe::new();
        let serial: SharedConnection = MockConnection::new("serial");
        pipeline
            .add_action(
                Box::new(
                    SucceedingAction::new("connect")
                        .returning(serial)
                        .with_probe(Arc::clone(&first)),
                ),
                None,
            )
            .unwrap();
        pipeline
            .add_action(
                Box::new(FailingAction::new("boot", FailureKind::Infrastructure).with_probe(Arc::clone(&failing))),
                None,
            )
            .unwrap();

        let result = pipeline.run_actions(None, far_deadline()).await;
        assert_failed_with(&result, FailureKind::Infrastructure, "boot failed");
        assert_eq!(failing.cleanup_connections(), vec![Some("serial".to_string())]);
        assert_eq!(first.cleanups(), 0);

        pipeline.cleanup(pipeline.last_connection()).await;
        assert_eq!(first.cleanups(), 1);
        assert_eq!(failing.cleanups(), 1);
    }

    #[tokio::test]
    async fn test_diagnostics_run_for_raised_triggers() {
        let diagnostic = Arc::new(CountingDiagnostic::new("usb"));
        let (job, mut pipeline) = TestJob::new().with_diagnostic(diagnostic.clone()).root();
        let serial: SharedConnection = MockConnection::new("serial");
        pipeline
            .add_action(Box::new(SucceedingAction::new("connect").returning(serial)), None)
            .unwrap();
        pipeline
            .add_action(
                Box::new(FailingAction::new("flash", FailureKind::Infrastructure).with_trigger("usb")),
                None,
            )
            .unwrap();

        let result = pipeline.run_actions(None, far_deadline()).await;
        assert_failed_with(&result, FailureKind::Infrastructure, "flash failed");
        assert_eq!(diagnostic.runs(), 1);
        assert_eq!(diagnostic.connections(), vec![Some("serial".to_string())]);
        assert!(job.pending_triggers().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_a_bug() {
        let (_job, mut pipeline) = TestJob::new().root();
        pipeline
            .add_action(
                Box::new(FailingAction::new("flash", FailureKind::Test).with_trigger("bogus")),
                None,
            )
            .unwrap();

        let result = pipeline.run_actions(None, far_deadline()).await;
        assert_failed_with(&result, FailureKind::EngineBug, "Unknown diagnostic trigger 'bogus'");
    }

    #[tokio::test]
    async fn test_timeouts_do_not_run_diagnostics() {
        let diagnostic = Arc::new(CountingDiagnostic::new("usb"));
        let (job, mut pipeline) = TestJob::new().with_diagnostic(diagnostic.clone()).root();
        pipeline
            .add_action(
                Box::new(FailingAction::new("flash", FailureKind::Timeout).with_trigger("usb")),
                None,
            )
            .unwrap();

        let result = pipeline.run_actions(None, far_deadline()).await;
        assert_failed_with(&result, FailureKind::Timeout, "flash failed");
        assert_eq!(diagnostic.runs(), 0);
        assert_eq!(job.pending_triggers(), vec!["usb"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_budget_stops_a_slow_action() {
        let (_job, mut pipeline) = TestJob::new().root();
        let next = ActionProbe::new();
        pipeline
            .add_action(
                Box::new(SlowAction::new("slow", Duration::from_secs(10))),
                params(json!({"timeout": {"seconds": 2}})),
            )
            .unwrap();
        pipeline
            .add_action(Box::new(SucceedingAction::new("next").with_probe(Arc::clone(&next))), None)
            .unwrap();

        let start = Instant::now();
        let result = pipeline.run_actions(None, far_deadline()).await;
        assert_failed_with(&result, FailureKind::Timeout, "slow timed out");
        assert_eq!(start.elapsed().as_secs(), 2);
        assert_eq!(next.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_on_timeout_at_root() {
        let (_job, mut pipeline) = TestJob::new().root();
        let next = ActionProbe::new();
        pipeline
            .add_action(
                Box::new(SlowAction::new("slow", Duration::from_secs(10))),
                params(json!({"timeout": {"seconds": 1, "skip": true}})),
            )
            .unwrap();
        pipeline
            .add_action(Box::new(SucceedingAction::new("next").with_probe(Arc::clone(&next))), None)
            .unwrap();

        pipeline.run_actions(None, far_deadline()).await.unwrap();
        assert_eq!(next.runs(), 1);
        let slow = pipeline.find("slow").unwrap();
        assert!(slow.base().results().contains_key("fail"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_is_ignored_below_the_root() {
        let job = TestJob::new().build();
        let parent = ParentInfo {
            name: "boot-retry".to_string(),
            level: "1".to_string(),
            section: "boot".to_string(),
        };
        let mut pipeline = Pipeline::with_parent(job, parent, Parameters::new());
        pipeline
            .add_action(
                Box::new(SlowAction::new("slow", Duration::from_secs(10))),
                params(json!({"timeout": {"seconds": 1, "skip": true}})),
            )
            .unwrap();

        let result = pipeline.run_actions(None, far_deadline()).await;
        assert_failed_with(&result, FailureKind::Timeout, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_parent_deadline() {
        let (_job, mut pipeline) = TestJob::new().root();
        let probe = ActionProbe::new();
        pipeline
            .add_action(Box::new(SucceedingAction::new("late").with_probe(Arc::clone(&probe))), None)
            .unwrap();

        let result = pipeline.run_actions(None, Instant::now()).await;
        assert_failed_with(&result, FailureKind::Timeout, "no time left");
        assert_eq!(probe.runs(), 0);
        assert_eq!(probe.cleanups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_record_shows_clamped_timeout() {
        let sink = Arc::new(CollectingEventSink::new());
        let (_job, mut pipeline) = TestJob::new().with_sink(sink.clone()).root();
        pipeline
            .add_action(
                Box::new(SucceedingAction::new("deploy-ok")),
                params(json!({"timeout": {"minutes": 5}})),
            )
            .unwrap();

        pipeline
            .run_actions(None, Instant::now() + Duration::from_secs(10))
            .await
            .unwrap();

        let starts = sink.payloads(ACTION_START);
        assert_eq!(starts[0]["timeout"], "00:00:10");
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_action_timeout_is_bounded_by_parent() {
        let (_job, mut pipeline) = TestJob::new().root();
        pipeline
            .add_action(
                Box::new(SlowAction::new("slow", Duration::from_secs(5))),
                params(json!({"timeout": {"days": 200_000_000_000_000_u64}})),
            )
            .unwrap();

        pipeline.run_actions(None, far_deadline()).await.unwrap();
        let slow = pipeline.find("slow").unwrap();
        assert_eq!(slow.base().timeout().elapsed(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_panic_becomes_engine_bug() {
        let (_job, mut pipeline) = TestJob::new().root();
        let action = PanickingAction {
            base: ActionBase::new("explode", "explode", "panic on run").with_section("test"),
        };
        pipeline.add_action(Box::new(action), None).unwrap();

        let result = pipeline.run_actions(None, far_deadline()).await;
        assert_failed_with(&result, FailureKind::EngineBug, "board exploded");
    }

    #[tokio::test]
    async fn test_records_emitted() {
        let sink = Arc::new(CollectingEventSink::new());
        let (_job, mut pipeline) = TestJob::new().with_sink(sink.clone()).root();
        pipeline.add_action(Box::new(SucceedingAction::new("deploy-ok")), None).unwrap();
        pipeline
            .add_action(Box::new(FailingAction::new("boot", FailureKind::Test)), None)
            .unwrap();

        let _ = pipeline.run_actions(None, far_deadline()).await;

        let starts = sink.payloads(ACTION_START);
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0]["level"], "1");
        assert_eq!(starts[1]["name"], "boot");
        assert_eq!(sink.payloads(ACTION_END).len(), 2);

        let deployed = assert_last_result(&sink, "deploy-ok", "pass");
        assert_eq!(deployed["extra"]["success"], "deploy-ok");
        let failed = assert_last_result(&sink, "boot", "fail");
        assert_eq!(failed["extra"]["fail"], "boot failed");
        assert_eq!(failed["definition"], "dispatcher");
        assert_eq!(failed["namespace"], "common");
    }

    #[test]
    fn test_describe_nests_child_pipelines() {
        let (_job, mut pipeline) = TestJob::new().root();
        pipeline.add_action(Box::new(SucceedingAction::new("deploy-ok")), None).unwrap();
        pipeline.add_action(Box::new(boot_retry(vec!["power-on"])), None).unwrap();

        let tree = pipeline.describe(false);
        assert_eq!(
            tree,
            json!([
                {"class": "succeeding", "name": "deploy-ok", "level": "1"},
                {
                    "class": "retry",
                    "name": "boot-retry",
                    "level": "2",
                    "pipeline": [{"class": "succeeding", "name": "power-on", "level": "2.1"}],
                },
            ])
        );

        let verbose = pipeline.describe(true);
        assert_eq!(verbose[1]["section"], "boot");
        assert_eq!(verbose[1]["pipeline"][0]["section"], "boot");
        assert_eq!(verbose[0]["timeout"], 30);
    }

    #[tokio::test]
    async fn test_protocol_calls_are_collated() {
        let protocol = Arc::new(
            MockProtocol::new("lava-multinode")
                .with_reply(json!({"ip": "10.0.0.2"}))
                .with_timeout_override(Duration::from_secs(120)),
        );
        let (job, mut pipeline) = TestJob::new().with_protocol(protocol.clone()).root();
        pipeline
            .add_action(
                Box::new(PlainAction::new("deploy-ok")),
                params(json!({
                    "protocols": {
                        "lava-multinode": [
                            {"action": "deploy-ok", "request": "lava-send", "messageID": "ready"},
                            {"action": "boot-ok", "request": "lava-wait"},
                        ],
                    },
                })),
            )
            .unwrap();

        pipeline.run_actions(None, far_deadline()).await.unwrap();

        let calls = protocol.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "deploy-ok");
        let stored = job
            .store()
            .get(DataPath::new("common", "lava-multinode", "lava-multinode", "lava-send"));
        assert_eq!(stored, Some(json!({"ip": "10.0.0.2"})));
        let action = pipeline.find("deploy-ok").unwrap();
        assert_eq!(action.base().connection_timeout().duration(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_wrapper_makes_its_protocol_calls_once() {
        let protocol = Arc::new(MockProtocol::new("lava-multinode").with_reply(json!({"role": "server"})));
        let (job, mut pipeline) = TestJob::new().with_protocol(protocol.clone()).root();
        let wrapper = RetryAction::new("boot-retry", "boot with retries", "retry the boot")
            .with_section("boot")
            .with_child(|| Box::new(FlakyAction::new("boot-flaky", 1)) as Box<dyn Action>);
        pipeline
            .add_action(
                Box::new(wrapper),
                params(json!({
                    "failure_retry": 2,
                    "protocols": {
                        "lava-multinode": [{"action": "boot-retry", "request": "lava-sync"}],
                    },
                })),
            )
            .unwrap();

        pipeline.run_actions(None, far_deadline()).await.unwrap();

        let calls = protocol.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "boot-retry");
        let stored = job
            .store()
            .get(DataPath::new("common", "lava-multinode", "lava-multinode", "lava-sync"));
        assert_eq!(stored, Some(json!({"role": "server"})));
        assert_eq!(pipeline.find("boot-retry").unwrap().base().results()["attempts"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_then_boot_recovering_on_second_attempt() {
        let sink = Arc::new(CollectingEventSink::new());
        let (_job, mut pipeline) = TestJob::new().with_sink(sink.clone()).root();
        let boot = ActionProbe::new();
        let boot_probe = Arc::clone(&boot);
        pipeline.add_action(Box::new(SucceedingAction::new("deploy-ok")), None).unwrap();
        let retry = RetryAction::new("boot-retry", "boot with retries", "retry the boot")
            .with_section("boot")
            .with_child(move || {
                Box::new(FlakyAction::new("boot-flaky", 1).with_probe(Arc::clone(&boot_probe))) as Box<dyn Action>
            });
        pipeline
            .add_action(Box::new(retry), params(json!({"failure_retry": 2})))
            .unwrap();
        pipeline.validate_actions().unwrap();

        pipeline.run_actions(None, far_deadline()).await.unwrap();

        assert_eq!(boot.runs(), 2);
        assert_eq!(boot.cleanups(), 1);
        let record = assert_last_result(&sink, "boot-retry", "pass");
        assert_eq!(record["extra"]["attempts"], 2);
        assert_eq!(record["level"], "2");
        assert_last_result(&sink, "boot-flaky", "pass");
    }
}
