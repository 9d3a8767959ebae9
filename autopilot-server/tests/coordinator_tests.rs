use std::sync::Arc;
use std::time::Duration;

use autopilot::dom::{DomSnapshot, NodeSpec};
use autopilot::session::{FailureMode, MemorySession, SessionOp};
use autopilot::{
    AutomationError, FileStore, StepKind, Workflow, WorkflowLibrary, WorkflowStatus,
    WorkflowStep,
};
use autopilot_server::{
    ControlMessage, CoordinatorConfig, Notification, Phase, PlaybackCoordinator, Transition,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;

const LOGIN: &str = "https://x.test/login";
const HOME: &str = "https://x.test/home";

fn login_page(with_user_field: bool) -> DomSnapshot {
    let mut body = NodeSpec::new("body").child(NodeSpec::new("button").id("login").text("Log in"));
    if with_user_field {
        body = body.child(NodeSpec::new("input").id("user"));
    }
    DomSnapshot::new(NodeSpec::new("html").child(body))
}

fn session(with_user_field: bool) -> Arc<MemorySession> {
    Arc::new(MemorySession::new().with_page(LOGIN, login_page(with_user_field)))
}

fn coordinator(session: Arc<MemorySession>) -> Arc<PlaybackCoordinator> {
    Arc::new(PlaybackCoordinator::new(
        session,
        WorkflowLibrary::in_memory(),
        CoordinatorConfig::default(),
    ))
}

fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
    let mut wf = Workflow::new("login flow").unwrap();
    for step in steps {
        wf.push_step(step);
    }
    wf
}

fn login_workflow() -> Workflow {
    workflow(vec![
        WorkflowStep::navigation(LOGIN),
        WorkflowStep::click("#login"),
        WorkflowStep::input("#user", "alice"),
        WorkflowStep::navigation(HOME),
    ])
}

/// Collects notifications up to and including `PLAYBACK_COMPLETE`.
async fn until_complete(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    loop {
        let notification = rx.recv().await.unwrap();
        let done = matches!(notification, Notification::PlaybackComplete { .. });
        seen.push(notification);
        if done {
            return seen;
        }
    }
}

fn progress_kinds(notifications: &[Notification]) -> Vec<StepKind> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::PlaybackProgress { step, .. } => Some(step.kind),
            _ => None,
        })
        .collect()
}

async fn play(coordinator: &Arc<PlaybackCoordinator>, wf: &Workflow) -> Vec<Notification> {
    coordinator.library().save(wf).await.unwrap();
    let mut rx = coordinator.subscribe();
    let transition = coordinator
        .handle(ControlMessage::StartPlayback {
            workflow: wf.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(transition, Transition::PlaybackStarted { .. }));
    until_complete(&mut rx).await
}

#[tokio::test(start_paused = true)]
async fn clean_run_reports_progress_then_completion() {
    let coordinator = coordinator(session(true));
    let wf = workflow(vec![
        WorkflowStep::click("#login"),
        WorkflowStep::input("#user", "alice"),
        WorkflowStep::navigation(HOME),
    ]);

    let seen = play(&coordinator, &wf).await;

    assert_eq!(seen.len(), 4);
    assert!(seen[..3]
        .iter()
        .all(|n| matches!(n, Notification::PlaybackProgress { total: 3, .. })));
    assert_eq!(
        progress_kinds(&seen),
        [StepKind::Click, StepKind::Input, StepKind::Navigation]
    );
    assert_eq!(seen[3], Notification::PlaybackComplete { errors: vec![] });

    assert_eq!(coordinator.status().await.state, Phase::Idle);
    let saved = coordinator.library().find(&wf.id).await.unwrap().unwrap();
    assert_eq!(saved.success_count, 1);
    assert_eq!(saved.status, Some(WorkflowStatus::Completed));
    assert!(saved.last_run.is_some());
}

#[tokio::test(start_paused = true)]
async fn recoverable_failure_is_reported_and_run_continues() {
    let coordinator = coordinator(session(false));
    let wf = login_workflow();

    let seen = play(&coordinator, &wf).await;

    assert_eq!(
        progress_kinds(&seen),
        [StepKind::Navigation, StepKind::Click, StepKind::Navigation]
    );
    let Some(Notification::PlaybackComplete { errors }) = seen.last() else {
        panic!("run did not complete: {seen:?}");
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].step.as_ref().unwrap().kind, StepKind::Input);
    assert!(!seen
        .iter()
        .any(|n| matches!(n, Notification::PlaybackError { .. })));

    assert_eq!(coordinator.playback_errors().len(), 1);
    let saved = coordinator.library().find(&wf.id).await.unwrap().unwrap();
    assert_eq!(saved.failure_count, 1);
    assert_eq!(saved.status, Some(WorkflowStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_emits_error_then_completion() {
    let session = session(true);
    session.inject_failure(
        SessionOp::Navigate,
        AutomationError::PlatformError("net::ERR_NAME_NOT_RESOLVED".into()),
        FailureMode::Always,
    );
    let coordinator = coordinator(session.clone());
    let wf = login_workflow();

    let seen = play(&coordinator, &wf).await;

    assert_eq!(seen.len(), 2);
    match &seen[0] {
        Notification::PlaybackError { message, step } => {
            assert!(message.starts_with("Navigation failed"));
            assert_eq!(step.as_ref().unwrap().kind, StepKind::Navigation);
        }
        other => panic!("expected PLAYBACK_ERROR, got {other:?}"),
    }
    assert!(matches!(&seen[1], Notification::PlaybackComplete { errors } if errors.len() == 1));
    assert_eq!(session.invocations(SessionOp::Navigate), 3);
    assert_eq!(coordinator.status().await.state, Phase::Idle);

    // the coordinator accepts a new run afterwards
    session.clear_failures();
    let seen = play(&coordinator, &wf).await;
    assert_eq!(seen.last(), Some(&Notification::PlaybackComplete { errors: vec![] }));
}

#[tokio::test(start_paused = true)]
async fn stop_playback_finishes_the_current_step_only() {
    let coordinator = coordinator(session(true));
    let wf = workflow(vec![
        WorkflowStep::navigation(LOGIN),
        WorkflowStep::click("#login"),
        WorkflowStep::click("#login"),
    ]);
    coordinator.library().save(&wf).await.unwrap();
    let mut rx = coordinator.subscribe();

    coordinator
        .handle(ControlMessage::StartPlayback {
            workflow: wf.clone(),
        })
        .await
        .unwrap();
    let first = rx.recv().await.unwrap();
    assert!(matches!(first, Notification::PlaybackProgress { .. }));

    let transition = coordinator.handle(ControlMessage::StopPlayback).await.unwrap();
    assert!(matches!(transition, Transition::PlaybackStopping { .. }));

    let rest = until_complete(&mut rx).await;
    assert_eq!(rest, vec![Notification::PlaybackComplete { errors: vec![] }]);
    assert_eq!(coordinator.status().await.state, Phase::Idle);

    let saved = coordinator.library().find(&wf.id).await.unwrap().unwrap();
    assert_eq!((saved.success_count, saved.failure_count), (0, 0));
    assert!(saved.last_run.is_some());
}

#[tokio::test(start_paused = true)]
async fn only_one_activity_at_a_time() {
    let coordinator = coordinator(session(true));
    let wf = login_workflow();
    let mut rx = coordinator.subscribe();

    let started = coordinator
        .handle(ControlMessage::StartPlayback {
            workflow: wf.clone(),
        })
        .await
        .unwrap();
    let Transition::PlaybackStarted { run_id } = started else {
        panic!("playback did not start");
    };
    let status = coordinator.status().await;
    assert_eq!(status.state, Phase::Playing);
    assert_eq!(status.run_id.as_deref(), Some(run_id.as_str()));

    for message in [
        ControlMessage::StartPlayback {
            workflow: wf.clone(),
        },
        ControlMessage::StartRecording { name: None },
        ControlMessage::StopRecording,
        ControlMessage::RecordStep {
            step: WorkflowStep::click("#login"),
        },
    ] {
        assert!(coordinator.handle(message).await.unwrap().is_ignored());
    }
    assert_eq!(coordinator.status().await.run_id.as_deref(), Some(run_id.as_str()));

    coordinator.handle(ControlMessage::StopPlayback).await.unwrap();
    until_complete(&mut rx).await;

    assert!(coordinator
        .handle(ControlMessage::StopPlayback)
        .await
        .unwrap()
        .is_ignored());
}

#[tokio::test]
async fn recording_lifecycle_persists_the_workflow() {
    let coordinator = coordinator(session(true));
    let library = coordinator.library().clone();

    assert!(coordinator
        .handle(ControlMessage::StopRecording)
        .await
        .unwrap()
        .is_ignored());
    assert!(coordinator
        .handle(ControlMessage::RecordStep {
            step: WorkflowStep::click("#login"),
        })
        .await
        .unwrap()
        .is_ignored());

    let mut rx = coordinator.subscribe();
    let Transition::RecordingStarted { workflow_id } = coordinator
        .handle(ControlMessage::StartRecording {
            name: Some("signup".into()),
        })
        .await
        .unwrap()
    else {
        panic!("recording did not start");
    };
    assert_eq!(
        rx.recv().await.unwrap(),
        Notification::RecordingStarted {
            workflow_id: workflow_id.clone()
        }
    );

    let status = coordinator.status().await;
    assert_eq!(status.state, Phase::Recording);
    assert_eq!(status.target_id.as_deref(), Some("tab-1"));
    assert_eq!(library.current().await.unwrap().unwrap().id, workflow_id);

    assert!(coordinator
        .handle(ControlMessage::StartPlayback {
            workflow: login_workflow(),
        })
        .await
        .unwrap()
        .is_ignored());

    let recorded = coordinator
        .handle(ControlMessage::RecordStep {
            step: WorkflowStep::input(" #user ", "<alice>"),
        })
        .await
        .unwrap();
    let Transition::StepRecorded { step } = recorded else {
        panic!("step was not recorded");
    };
    assert_eq!(step.selector.as_deref(), Some("#user"));
    assert_eq!(step.value.as_deref(), Some("alice"));

    let mut nav = WorkflowStep::navigation(LOGIN);
    nav.url = None;
    assert!(coordinator
        .handle(ControlMessage::RecordStep { step: nav })
        .await
        .unwrap()
        .is_ignored());

    assert_eq!(library.current().await.unwrap().unwrap().steps.len(), 1);

    let Transition::RecordingStopped { workflow } =
        coordinator.handle(ControlMessage::StopRecording).await.unwrap()
    else {
        panic!("recording did not stop");
    };
    assert_eq!(workflow.name, "signup");
    assert_eq!(workflow.steps.len(), 1);
    assert!(library.current().await.unwrap().is_none());
    assert_eq!(library.saved().await.unwrap(), vec![workflow]);
    assert_eq!(coordinator.status().await.state, Phase::Idle);
}

#[tokio::test]
async fn unnamed_recordings_get_a_default_name() {
    let coordinator = coordinator(session(true));
    coordinator
        .handle(ControlMessage::StartRecording {
            name: Some("   ".into()),
        })
        .await
        .unwrap();
    let Transition::RecordingStopped { workflow } =
        coordinator.handle(ControlMessage::StopRecording).await.unwrap()
    else {
        panic!("recording did not stop");
    };
    assert_eq!(workflow.name, "Recorded workflow");
}

#[tokio::test]
async fn live_interactions_are_recorded_and_persisted() {
    let (feed, _keep) = broadcast::channel::<Value>(16);
    let coordinator = Arc::new(
        PlaybackCoordinator::new(
            session(true),
            WorkflowLibrary::in_memory(),
            CoordinatorConfig::default(),
        )
        .with_interaction_source(Arc::new(feed.clone())),
    );
    coordinator
        .handle(ControlMessage::StartRecording { name: None })
        .await
        .unwrap();

    let page = serde_json::to_value(login_page(true)).unwrap();
    feed.send(json!({"kind": "location_changed", "url": LOGIN}))
        .unwrap();
    feed.send(json!({"kind": "click", "document": page, "target": 2}))
        .unwrap();

    let mut persisted = 0;
    for _ in 0..100 {
        persisted = coordinator
            .library()
            .current()
            .await
            .unwrap()
            .map_or(0, |wf| wf.steps.len());
        if persisted == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(persisted, 2);

    let Transition::RecordingStopped { workflow } =
        coordinator.handle(ControlMessage::StopRecording).await.unwrap()
    else {
        panic!("recording did not stop");
    };
    assert_eq!(workflow.steps[0].url.as_deref(), Some(LOGIN));
    assert_eq!(workflow.steps[1].selector.as_deref(), Some("#login"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_and_live_steps_persist_to_disk_without_errors() {
    let dir = tempfile::tempdir().unwrap();
    let library = WorkflowLibrary::new(Arc::new(FileStore::new(dir.path())));
    let (feed, _keep) = broadcast::channel::<Value>(256);
    let coordinator = Arc::new(
        PlaybackCoordinator::new(session(true), library.clone(), CoordinatorConfig::default())
            .with_interaction_source(Arc::new(feed.clone())),
    );
    coordinator
        .handle(ControlMessage::StartRecording { name: None })
        .await
        .unwrap();

    let live = tokio::spawn(async move {
        for _ in 0..60 {
            feed.send(json!({"kind": "keypress", "key": "Tab"})).unwrap();
            tokio::task::yield_now().await;
        }
    });
    for n in 0..60 {
        let transition = coordinator
            .handle(ControlMessage::RecordStep {
                step: WorkflowStep::click(format!("#item-{n}")),
            })
            .await
            .unwrap();
        assert!(matches!(transition, Transition::StepRecorded { .. }));
    }
    live.await.unwrap();

    let mut persisted = 0;
    for _ in 0..200 {
        persisted = library.current().await.unwrap().map_or(0, |wf| wf.steps.len());
        if persisted == 120 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(persisted, 120);

    let Transition::RecordingStopped { workflow } =
        coordinator.handle(ControlMessage::StopRecording).await.unwrap()
    else {
        panic!("recording did not stop");
    };
    assert_eq!(library.saved().await.unwrap(), vec![workflow]);
    assert!(library.current().await.unwrap().is_none());
}

#[tokio::test]
async fn host_failures_surface_as_errors_and_leave_state_idle() {
    let session = session(true);
    session.inject_failure(
        SessionOp::ActiveTarget,
        AutomationError::PermissionDenied("tabs".into()),
        FailureMode::Always,
    );
    let coordinator = coordinator(session);

    let err = coordinator
        .handle(ControlMessage::StartRecording { name: None })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Permission denied"));
    assert_eq!(coordinator.status().await.state, Phase::Idle);
    assert!(coordinator.library().current().await.unwrap().is_none());
}
