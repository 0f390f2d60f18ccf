//! Unit tests for the provisioning workflow.

use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};

use super::*;
use crate::command::CommandError;
use crate::self_destruct::WatchdogScript;
use crate::test_support::{FakeProvider, FakeTunnel, RecordingExecutor};

const ADDRESS: &str = "203.0.113.7";

type TestWorkflow = ProvisioningWorkflow<FakeProvider, FakeTunnel, RecordingExecutor>;

struct Harness {
    provider: FakeProvider,
    tunnel: FakeTunnel,
    executor: RecordingExecutor,
}

impl Harness {
    fn new(exit_code: Option<i32>) -> Self {
        Self {
            provider: FakeProvider::new("1001"),
            tunnel: FakeTunnel::exiting_with(exit_code),
            executor: RecordingExecutor::new(),
        }
    }

    fn workflow(&self, policy: DestructionPolicy) -> TestWorkflow {
        ProvisioningWorkflow::new(
            self.provider.clone(),
            self.tunnel.clone(),
            SelfDestruct::new(
                self.executor.clone(),
                WatchdogScript::builtin(),
                "assembler.py",
            ),
            policy,
        )
        .with_max_retries(3)
        .with_initial_delay(Duration::ZERO)
        .with_poll_interval(Duration::ZERO)
    }
}

#[fixture]
fn request() -> ProvisioningRequest {
    ProvisioningRequest::builder()
        .region("nyc1")
        .size("512mb")
        .image("ubuntu-20-04-x64")
        .name("instavpn")
        .build()
        .expect("valid request")
}

#[fixture]
fn options() -> SessionOptions {
    SessionOptions {
        subnet: String::from("0/0"),
        proxy_dns: false,
        extra_args: String::new(),
    }
}

/// Blocks the calling thread until another task opens it, giving up after a
/// few seconds.
#[derive(Clone, Debug)]
struct Gate(Arc<Mutex<mpsc::Receiver<()>>>);

impl Gate {
    fn new() -> (mpsc::Sender<()>, Self) {
        let (open, gate) = mpsc::channel();
        (open, Self(Arc::new(Mutex::new(gate))))
    }

    fn wait(&self) -> Result<(), String> {
        self.0
            .lock()
            .expect("gate lock")
            .recv_timeout(Duration::from_secs(5))
            .map_err(|err| format!("gate never opened: {err}"))
    }
}

/// Tunnel whose executable lookup waits on a [`Gate`].
#[derive(Clone, Debug)]
struct GatedTunnel {
    gate: Gate,
    inner: FakeTunnel,
}

impl Tunnel for GatedTunnel {
    fn resolve_executable(&self) -> Result<Utf8PathBuf, TunnelError> {
        self.gate.wait().map_err(TunnelError::ToolUnavailable)?;
        self.inner.resolve_executable()
    }

    fn start_session(
        &self,
        executable: &Utf8Path,
        spec: &SessionSpec,
        on_exit: ExitCallback,
    ) -> Result<TunnelSession, TunnelError> {
        self.inner.start_session(executable, spec, on_exit)
    }
}

/// Executor whose remote call waits on a [`Gate`].
#[derive(Clone, Debug)]
struct GatedExecutor(Gate);

impl RemoteExecutor for GatedExecutor {
    fn run_detached(&self, _target: &RemoteTarget, _script: &str) -> Result<(), SelfDestructError> {
        self.0.wait().map_err(|message| {
            SelfDestructError::Remote(CommandError::Spawn {
                program: String::from("ssh"),
                message,
            })
        })
    }
}

fn active_descriptor(ip: Option<&str>) -> MachineDescriptor {
    MachineDescriptor {
        id: MachineId::from("77"),
        ip_address: ip.and_then(|raw| raw.parse().ok()),
        status: MachineStatus::Active,
        created_at: None,
    }
}

#[rstest]
#[tokio::test]
async fn provision_counts_retries_until_active(request: ProvisioningRequest) {
    let harness = Harness::new(Some(0));
    harness.provider.push_status(MachineStatus::New, None);
    harness.provider.push_status(MachineStatus::New, None);
    harness
        .provider
        .push_status(MachineStatus::Active, Some(ADDRESS));

    let machine = harness
        .workflow(DestructionPolicy::default())
        .provision(MachineSource::Create(request.clone()))
        .await
        .expect("machine becomes active");

    assert_eq!(machine.retries(), 2);
    assert_eq!(machine.id().as_str(), "1001");
    assert_eq!(harness.provider.status_calls(), 3);
    assert_eq!(harness.provider.create_requests(), vec![request]);
}

#[rstest]
#[tokio::test]
async fn provision_times_out_after_budget(request: ProvisioningRequest) {
    let harness = Harness::new(Some(0));

    let err = harness
        .workflow(DestructionPolicy::default())
        .provision(MachineSource::Create(request))
        .await
        .expect_err("never active");

    assert!(
        matches!(err, WorkflowError::Timeout { attempts: 3, ref machine_id } if machine_id.as_str() == "1001"),
        "unexpected error: {err}"
    );
    assert_eq!(harness.provider.status_calls(), 3);
    assert!(harness.provider.destroyed().is_empty());
}

#[rstest]
#[tokio::test]
async fn provision_stops_on_archived_machine(request: ProvisioningRequest) {
    let harness = Harness::new(Some(0));
    harness.provider.push_status(MachineStatus::New, None);
    harness.provider.push_status(MachineStatus::Archive, None);

    let err = harness
        .workflow(DestructionPolicy::default())
        .provision(MachineSource::Create(request))
        .await
        .expect_err("archived");

    assert!(matches!(
        err,
        WorkflowError::Terminal {
            status: MachineStatus::Archive,
            ..
        }
    ));
    assert_eq!(harness.provider.status_calls(), 2);
}

#[rstest]
#[tokio::test]
async fn provision_retries_unknown_statuses(request: ProvisioningRequest) {
    let harness = Harness::new(Some(0));
    harness
        .provider
        .push_status(MachineStatus::Other(String::from("rebooting")), None);
    harness
        .provider
        .push_status(MachineStatus::Active, Some(ADDRESS));

    let machine = harness
        .workflow(DestructionPolicy::default())
        .provision(MachineSource::Create(request))
        .await
        .expect("machine becomes active");

    assert_eq!(machine.retries(), 1);
}

#[rstest]
#[tokio::test]
async fn provision_reports_create_and_status_failures(request: ProvisioningRequest) {
    let harness = Harness::new(Some(0));
    harness.provider.fail_create();
    let err = harness
        .workflow(DestructionPolicy::default())
        .provision(MachineSource::Create(request.clone()))
        .await
        .expect_err("create fails");
    assert!(matches!(err, WorkflowError::Provision(_)));
    assert_eq!(harness.provider.status_calls(), 0);

    let harness = Harness::new(Some(0));
    harness.provider.fail_status();
    let err = harness
        .workflow(DestructionPolicy::default())
        .provision(MachineSource::Create(request))
        .await
        .expect_err("status fails");
    assert!(matches!(err, WorkflowError::Status { .. }));
}

#[tokio::test]
async fn existing_active_machine_skips_creation() {
    let harness = Harness::new(Some(0));
    let descriptor = active_descriptor(Some(ADDRESS));

    let machine = harness
        .workflow(DestructionPolicy::default())
        .provision(MachineSource::Existing(descriptor.clone()))
        .await
        .expect("adopted");

    assert_eq!(machine.descriptor(), &descriptor);
    assert_eq!(machine.retries(), 0);
    assert!(harness.provider.create_requests().is_empty());
    assert_eq!(harness.provider.status_calls(), 0);
}

#[tokio::test]
async fn existing_inactive_machine_is_polled() {
    let harness = Harness::new(Some(0));
    harness
        .provider
        .push_status(MachineStatus::Active, Some(ADDRESS));
    let descriptor = MachineDescriptor {
        status: MachineStatus::New,
        ..active_descriptor(None)
    };

    let machine = harness
        .workflow(DestructionPolicy::default())
        .provision(MachineSource::Existing(descriptor))
        .await
        .expect("becomes active");

    assert_eq!(machine.id().as_str(), "77");
    assert!(harness.provider.create_requests().is_empty());
    assert_eq!(harness.provider.status_calls(), 1);
}

#[rstest]
#[case::failure(Some(1))]
#[case::signal(None)]
#[tokio::test]
async fn failed_tunnel_destroys_machine_once(options: SessionOptions, #[case] code: Option<i32>) {
    let harness = Harness::new(code);
    let policy = DestructionPolicy {
        scrub: true,
        ..DestructionPolicy::default()
    };
    let workflow = harness.workflow(policy);
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    let outcome = workflow
        .run_tunnel(&machine, &options)
        .await
        .expect("tunnel ran");

    assert_eq!(outcome.exit.code, code);
    assert_eq!(
        harness.provider.destroyed(),
        vec![(MachineId::from("77"), true)]
    );
}

#[rstest]
#[tokio::test]
async fn clean_tunnel_exit_keeps_machine(options: SessionOptions) {
    let harness = Harness::new(Some(0));
    let workflow = harness.workflow(DestructionPolicy::default());
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    let outcome = workflow
        .run_tunnel(&machine, &options)
        .await
        .expect("tunnel ran");

    assert_eq!(outcome.exit.exit_code(), 0);
    assert!(harness.provider.destroyed().is_empty());
}

#[rstest]
#[tokio::test]
async fn keep_policy_skips_teardown(options: SessionOptions) {
    let harness = Harness::new(Some(2));
    let policy = DestructionPolicy {
        destroy_on_exit: false,
        ..DestructionPolicy::default()
    };
    let workflow = harness.workflow(policy);
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    let outcome = workflow
        .run_tunnel(&machine, &options)
        .await
        .expect("tunnel ran");

    assert_eq!(outcome.exit.exit_code(), 2);
    assert!(harness.provider.destroyed().is_empty());
}

#[rstest]
#[tokio::test]
async fn destroy_failure_does_not_fail_the_session(options: SessionOptions) {
    let harness = Harness::new(Some(1));
    harness.provider.fail_destroy();
    let workflow = harness.workflow(DestructionPolicy::default());
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    let outcome = workflow
        .run_tunnel(&machine, &options)
        .await
        .expect("tunnel ran");

    assert_eq!(outcome.exit.exit_code(), 1);
    assert_eq!(harness.provider.destroyed().len(), 1);
}

#[rstest]
#[tokio::test]
async fn machine_without_address_cannot_connect(options: SessionOptions) {
    let harness = Harness::new(Some(0));
    let workflow = harness.workflow(DestructionPolicy::default());
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(None)))
        .await
        .expect("adopted");

    let err = workflow
        .run_tunnel(&machine, &options)
        .await
        .expect_err("no address");

    assert!(matches!(err, WorkflowError::MissingAddress { .. }));
    assert!(harness.tunnel.sessions().is_empty());
}

#[rstest]
#[tokio::test]
async fn unavailable_tunnel_tool_is_reported(options: SessionOptions) {
    let harness = Harness::new(Some(0));
    harness
        .tunnel
        .fail_resolution(TunnelError::ToolUnavailable(String::from("clone failed")));
    let workflow = harness.workflow(DestructionPolicy::default());
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    let err = workflow
        .run_tunnel(&machine, &options)
        .await
        .expect_err("no tool");

    assert!(matches!(
        err,
        WorkflowError::Tunnel(TunnelError::ToolUnavailable(_))
    ));
    assert!(harness.provider.destroyed().is_empty());
}

#[rstest]
#[tokio::test]
async fn tunnel_targets_machine_with_session_options(mut options: SessionOptions) {
    options.proxy_dns = true;
    options.subnet = String::from("10.0.0.0/8");
    let harness = Harness::new(Some(0));
    let workflow = harness.workflow(DestructionPolicy::default());
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    workflow
        .run_tunnel(&machine, &options)
        .await
        .expect("tunnel ran");

    assert_eq!(
        harness.tunnel.sessions(),
        vec![vec![
            String::from("/usr/bin/sshuttle"),
            String::from("--dns"),
            String::from("-vr"),
            String::from("root@203.0.113.7"),
            String::from("10.0.0.0/8"),
        ]]
    );
}

#[rstest]
#[tokio::test]
async fn self_destruct_is_installed_with_destroy_url(options: SessionOptions) {
    let harness = Harness::new(Some(0));
    let workflow = harness.workflow(DestructionPolicy::default());
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    workflow
        .run_tunnel(&machine, &options)
        .await
        .expect("tunnel ran");

    let runs = harness.executor.runs();
    assert_eq!(runs.len(), 1);
    let (target, script) = runs.first().expect("one run");
    assert_eq!(target.to_string(), "root@203.0.113.7");
    assert!(script.contains("https://provider.invalid/droplets/77/destroy/?scrub=false"));
    assert!(script.contains("300"));
    assert!(script.contains(r#"pgrep -f -- "$pattern""#));
}

#[rstest]
#[tokio::test]
async fn disabled_self_destruct_runs_nothing(options: SessionOptions) {
    let harness = Harness::new(Some(0));
    let policy = DestructionPolicy {
        self_destruct_timeout: None,
        ..DestructionPolicy::default()
    };
    let workflow = harness.workflow(policy);
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    workflow
        .run_tunnel(&machine, &options)
        .await
        .expect("tunnel ran");

    assert!(harness.executor.runs().is_empty());
}

#[rstest]
#[tokio::test]
async fn self_destruct_failure_is_not_fatal(options: SessionOptions) {
    let harness = Harness {
        executor: RecordingExecutor::failing(),
        ..Harness::new(Some(0))
    };
    let workflow = harness.workflow(DestructionPolicy::default());
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    assert!(
        workflow
            .install_self_destruct(
                &machine,
                &RemoteTarget {
                    user: String::from("root"),
                    host: ADDRESS.parse().expect("address"),
                },
            )
            .await
            .is_err()
    );

    let outcome = workflow
        .run_tunnel(&machine, &options)
        .await
        .expect("tunnel still runs");
    assert_eq!(outcome.exit.exit_code(), 0);
    assert_eq!(harness.tunnel.sessions().len(), 1);
}

#[rstest]
#[tokio::test]
async fn executable_lookup_does_not_stall_the_runtime(options: SessionOptions) {
    let (open, gate) = Gate::new();
    let tunnel = FakeTunnel::exiting_with(Some(0));
    let workflow = ProvisioningWorkflow::new(
        FakeProvider::new("1001"),
        GatedTunnel {
            gate,
            inner: tunnel.clone(),
        },
        SelfDestruct::new(
            RecordingExecutor::new(),
            WatchdogScript::builtin(),
            "assembler.py",
        ),
        DestructionPolicy::default(),
    );
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");

    let opener = tokio::spawn(async move { open.send(()).expect("gate open") });
    let connected = workflow
        .connect(&machine, &options)
        .await
        .expect("lookup finishes once the runtime opens the gate");
    opener.await.expect("opener task");

    assert_eq!(connected.target.to_string(), "root@203.0.113.7");
    assert_eq!(tunnel.sessions().len(), 1);
    connected.session.wait().await.expect("session");
}

#[tokio::test]
async fn self_destruct_install_does_not_stall_the_runtime() {
    let (open, gate) = Gate::new();
    let workflow = ProvisioningWorkflow::new(
        FakeProvider::new("1001"),
        FakeTunnel::exiting_with(Some(0)),
        SelfDestruct::new(GatedExecutor(gate), WatchdogScript::builtin(), "assembler.py"),
        DestructionPolicy::default(),
    );
    let machine = workflow
        .provision(MachineSource::Existing(active_descriptor(Some(ADDRESS))))
        .await
        .expect("adopted");
    let target = RemoteTarget {
        user: String::from("root"),
        host: ADDRESS.parse().expect("address"),
    };

    let opener = tokio::spawn(async move { open.send(()).expect("gate open") });
    let installed = workflow
        .install_self_destruct(&machine, &target)
        .await
        .expect("install finishes once the runtime opens the gate");
    opener.await.expect("opener task");

    assert!(installed);
}

#[tokio::test]
async fn account_keys_are_listed_or_reported() {
    let harness = Harness::new(Some(0));
    harness.provider.set_keys(&["11", "12"]);
    let keys = harness
        .workflow(DestructionPolicy::default())
        .account_keys()
        .await
        .expect("keys");
    assert_eq!(keys, vec![SshKeyId::from("11"), SshKeyId::from("12")]);

    harness.provider.fail_keys();
    let err = harness
        .workflow(DestructionPolicy::default())
        .account_keys()
        .await
        .expect_err("lookup fails");
    assert!(matches!(err, WorkflowError::KeyLookup(_)));
}

#[rstest]
#[tokio::test]
async fn execute_runs_the_whole_session(request: ProvisioningRequest, options: SessionOptions) {
    let harness = Harness::new(Some(1));
    harness
        .provider
        .push_status(MachineStatus::Active, Some(ADDRESS));

    let outcome = harness
        .workflow(DestructionPolicy::default())
        .execute(MachineSource::Create(request), &options)
        .await
        .expect("session ran");

    assert_eq!(outcome.machine.id.as_str(), "1001");
    assert_eq!(outcome.exit.exit_code(), 1);
    assert_eq!(
        harness.provider.destroyed(),
        vec![(MachineId::from("1001"), false)]
    );
}

#[test]
fn max_retries_never_drops_below_one() {
    let harness = Harness::new(Some(0));
    let workflow = harness.workflow(DestructionPolicy::default()).with_max_retries(0);
    assert_eq!(workflow.max_retries, 1);
}

#[test]
fn workflow_states_render_as_kebab_case() {
    assert_eq!(WorkflowState::TearingDown.to_string(), "tearing-down");
    assert_eq!(WorkflowState::Requesting.to_string(), "requesting");
}
