//! Behaviour tests for triggering and waiting on OS updates.

use nodeprep_agent::test_utils::FakeUpdateEngine;
use nodeprep_agent::update_engine::{
    UpdateEngineError, UpdateOperation, UpdateStatus, run_os_update,
};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

#[derive(Default)]
struct UpdateWorld {
    snapshot: Option<UpdateStatus>,
    backlog: Vec<UpdateStatus>,
    stream: Vec<UpdateStatus>,
    rejecting: bool,
    open: bool,
    engine: Option<FakeUpdateEngine>,
    result: Option<Result<Option<String>, UpdateEngineError>>,
}

#[fixture]
fn world() -> UpdateWorld {
    UpdateWorld::default()
}

fn status(operation: UpdateOperation, version: &str) -> UpdateStatus {
    UpdateStatus::new(operation).with_version(version)
}

fn checking() -> UpdateStatus {
    UpdateStatus::new(UpdateOperation::CheckingForUpdate)
}

fn engine(world: &UpdateWorld) -> &FakeUpdateEngine {
    world.engine.as_ref().expect("update ran")
}

#[given("the update daemon will stage OS {version}")]
fn given_update_available(world: &mut UpdateWorld, version: String) {
    world.snapshot = Some(checking());
    world.stream = vec![
        status(UpdateOperation::Downloading, &version),
        status(UpdateOperation::Verifying, &version),
        status(UpdateOperation::Finalizing, &version),
        status(UpdateOperation::UpdatedNeedReboot, &version),
    ];
}

#[given("the update daemon has no update")]
fn given_no_update(world: &mut UpdateWorld) {
    world.snapshot = Some(checking());
    world.stream = vec![UpdateStatus::new(UpdateOperation::Idle)];
}

#[given("the update daemon has a stale status for OS {version}")]
fn given_stale_status(world: &mut UpdateWorld, version: String) {
    world
        .backlog
        .push(status(UpdateOperation::UpdatedNeedReboot, &version));
}

#[given("the update daemon already staged OS {version}")]
fn given_already_staged(world: &mut UpdateWorld, version: String) {
    world.snapshot = Some(status(UpdateOperation::UpdatedNeedReboot, &version));
}

#[given("the update daemon finished checking before the agent looked")]
fn given_finished_check(world: &mut UpdateWorld) {
    world.snapshot = Some(UpdateStatus::new(UpdateOperation::Idle));
    world.backlog = vec![checking(), UpdateStatus::new(UpdateOperation::Idle)];
    world.open = true;
}

#[given("the update daemon rejects update requests")]
fn given_rejecting(world: &mut UpdateWorld) {
    world.rejecting = true;
}

#[when("the agent runs an OS update")]
fn when_update_runs(world: &mut UpdateWorld) {
    let engine = FakeUpdateEngine::new(world.snapshot.clone().unwrap_or_else(checking))
        .with_backlog(world.backlog.clone());
    let mut engine = if world.open {
        engine.with_open_stream(world.stream.clone())
    } else {
        engine.with_stream(world.stream.clone())
    };
    if world.rejecting {
        engine = engine.failing_attempt();
    }
    world.result = Some(run_os_update(&engine));
    world.engine = Some(engine);
}

#[then("OS {version} is reported as staged")]
fn then_staged(world: &mut UpdateWorld, version: String) {
    let result = world.result.as_ref().expect("update ran");
    assert_eq!(
        result.as_ref().expect("update settled").as_deref(),
        Some(version.as_str())
    );
}

#[then("no OS update is reported")]
fn then_no_update(world: &mut UpdateWorld) {
    let result = world.result.as_ref().expect("update ran");
    assert_eq!(result.as_ref().expect("update settled"), &None);
}

#[then("the daemon received one update request")]
fn then_one_request(world: &mut UpdateWorld) {
    assert_eq!(engine(world).attempts(), 1);
}

#[then("the OS update fails")]
fn then_fails(world: &mut UpdateWorld) {
    let result = world.result.as_ref().expect("update ran");
    assert!(matches!(result, Err(UpdateEngineError::Failed { .. })));
}

#[then("the status subscription is closed")]
fn then_closed(world: &mut UpdateWorld) {
    assert!(engine(world).stream_closed());
}

// ---------------------------------------------------------------------------
// Scenario bindings
// ---------------------------------------------------------------------------

#[scenario(
    path = "tests/features/os_update.feature",
    name = "An update is downloaded and staged"
)]
fn scenario_update_staged(world: UpdateWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/os_update.feature", name = "No update is available")]
fn scenario_no_update(world: UpdateWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/os_update.feature",
    name = "Stale statuses from before the trigger are ignored"
)]
fn scenario_stale_statuses(world: UpdateWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/os_update.feature",
    name = "An update staged before the agent started is found"
)]
fn scenario_already_staged(world: UpdateWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/os_update.feature",
    name = "A check that finished before the snapshot means no update"
)]
fn scenario_finished_check(world: UpdateWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/os_update.feature",
    name = "The daemon rejects the update request"
)]
fn scenario_rejected(world: UpdateWorld) {
    let _ = world;
}
