mod common;

use common::{assert_close, Platform};
use workflow_compute::{
    config::properties::{ExecutorProperties, MulticoreProperties},
    failure::NetworkOperation,
    services::job_table::JobState,
    workflow::task::TaskState,
    FailureCause, PilotJob, ServiceArgs, StandardJob, SubmitError, WorkflowExecutionEvent,
};

#[test]
fn dependent_tasks_of_one_job_run_in_order() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0"], MulticoreProperties::default());
    let workflow = platform.sim.workflow();
    let (a, b) = {
        let mut workflow = workflow.borrow_mut();
        let a = workflow.add_task("a", 10., 1, 1, 1., 0).unwrap();
        let b = workflow.add_task("b", 10., 1, 1, 1., 0).unwrap();
        workflow.add_control_dependency(a, b).unwrap();
        (a, b)
    };

    let job = platform
        .sim
        .cluster()
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(vec![a, b]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_no_events();

    let events = platform.events_of(job);
    assert_eq!(events.len(), 1);
    assert_close(events[0].0, 20.);
    assert_eq!(
        events[0].1,
        WorkflowExecutionEvent::StandardJobCompleted { job, service: mc }
    );
    let workflow = workflow.borrow();
    assert_eq!(workflow.task(a).start_date(), Some(0.));
    assert_eq!(workflow.task(a).end_date(), Some(10.));
    assert_eq!(workflow.task(b).start_date(), Some(10.));
    assert_eq!(workflow.task(b).end_date(), Some(20.));
    assert!(workflow.is_done());
}

#[test]
fn jobs_wait_for_busy_cores() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0"], MulticoreProperties::default());
    let cluster = platform.sim.cluster();

    let mut jobs = Vec::new();
    for name in ["first", "second"] {
        let task = platform
            .sim
            .workflow()
            .borrow_mut()
            .add_task(name, 100., 10, 10, 1., 0)
            .unwrap();
        let job = cluster
            .borrow_mut()
            .submit_standard_job(
                mc,
                StandardJob::new(vec![task]),
                ServiceArgs::new(),
                platform.wms_id,
            )
            .unwrap();
        jobs.push(job);
    }

    platform.sim.step_until_time(5.);
    assert_eq!(cluster.borrow().job_state(jobs[0]), Some(JobState::Running));
    assert_eq!(cluster.borrow().job_state(jobs[1]), Some(JobState::Pending));
    let info = cluster.borrow().resource_information(mc).unwrap();
    assert_eq!(info.num_idle_cores()["host0"], 0);

    platform.sim.step_until_no_events();
    assert_close(platform.events_of(jobs[0])[0].0, 10.);
    assert_close(platform.events_of(jobs[1])[0].0, 20.);
}

#[test]
fn impossible_tasks_are_rejected_on_submission() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0", "host1"], MulticoreProperties::default());
    let task = platform
        .sim
        .workflow()
        .borrow_mut()
        .add_task("wide", 10., 12, 12, 1., 0)
        .unwrap();

    let result = platform.sim.cluster().borrow_mut().submit_standard_job(
        mc,
        StandardJob::new(vec![task]),
        ServiceArgs::new(),
        platform.wms_id,
    );
    assert_eq!(
        result,
        Err(SubmitError::Failure(
            FailureCause::NotEnoughComputeResources { service: mc }
        ))
    );
}

#[test]
fn crashed_thread_fails_the_job() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0"], MulticoreProperties::default());
    let cluster = platform.sim.cluster();
    let task = platform
        .sim
        .workflow()
        .borrow_mut()
        .add_task("task", 100., 1, 1, 1., 0)
        .unwrap();
    let job = cluster
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(vec![task]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();

    platform.sim.step_until_time(5.);
    let crashed_at = platform.sim.time();
    assert!(!cluster
        .borrow_mut()
        .inject_compute_thread_failure(mc, "host1")
        .unwrap());
    assert!(cluster
        .borrow_mut()
        .inject_compute_thread_failure(mc, "host0")
        .unwrap());
    platform.sim.step_until_no_events();

    let events = platform.events_of(job);
    assert_eq!(events.len(), 1);
    assert_close(events[0].0, crashed_at);
    assert_eq!(
        events[0].1,
        WorkflowExecutionEvent::StandardJobFailed {
            job,
            service: mc,
            cause: FailureCause::ComputeThreadHasDied,
        }
    );
    assert_eq!(cluster.borrow().job_state(job), Some(JobState::Failed));
    assert_eq!(
        cluster.borrow().job_failure(job),
        Some(&FailureCause::ComputeThreadHasDied)
    );
    let workflow = platform.sim.workflow();
    assert_eq!(workflow.borrow().task(task).state(), TaskState::Failed);
    assert_eq!(workflow.borrow().task(task).failure_count(), 1);
}

#[test]
fn missing_input_file_fails_the_job() {
    let mut platform = Platform::new();
    let storage = platform.sim.add_storage("s", 1_000_000, 100.);
    let mc = platform
        .sim
        .add_multicore_service("multicore", &["host0"], Some(storage), MulticoreProperties::default())
        .unwrap();
    let (task, file) = {
        let workflow = platform.sim.workflow();
        let mut workflow = workflow.borrow_mut();
        let task = workflow.add_task("task", 10., 1, 1, 1., 0).unwrap();
        let file = workflow.add_file("input", 100).unwrap();
        workflow.add_input_file(task, file).unwrap();
        (task, file)
    };

    let job = platform
        .sim
        .cluster()
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(vec![task]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_no_events();

    assert_eq!(
        platform.events_of(job)[0].1,
        WorkflowExecutionEvent::StandardJobFailed {
            job,
            service: mc,
            cause: FailureCause::FileNotFound { file, storage },
        }
    );
}

#[test]
fn files_without_a_location_cannot_be_read() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0"], MulticoreProperties::default());
    let (task, file) = {
        let workflow = platform.sim.workflow();
        let mut workflow = workflow.borrow_mut();
        let task = workflow.add_task("task", 10., 1, 1, 1., 0).unwrap();
        let file = workflow.add_file("input", 100).unwrap();
        workflow.add_input_file(task, file).unwrap();
        (task, file)
    };

    let job = platform
        .sim
        .cluster()
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(vec![task]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_no_events();

    assert_eq!(
        platform.events_of(job)[0].1,
        WorkflowExecutionEvent::StandardJobFailed {
            job,
            service: mc,
            cause: FailureCause::NoStorageServiceForFile { file },
        }
    );
    assert_eq!(
        platform.sim.workflow().borrow().task(task).state(),
        TaskState::Failed
    );
}

#[test]
fn slow_transfers_time_out() {
    let mut platform = Platform::new();
    let storage = platform.sim.add_storage("s", 1_000_000, 10.);
    let properties = MulticoreProperties {
        executor: ExecutorProperties {
            network_timeout: Some(5.),
            ..Default::default()
        },
    };
    let mc = platform
        .sim
        .add_multicore_service("multicore", &["host0"], Some(storage), properties)
        .unwrap();
    let cluster = platform.sim.cluster();
    let (task, file) = {
        let workflow = platform.sim.workflow();
        let mut workflow = workflow.borrow_mut();
        let task = workflow.add_task("task", 10., 1, 1, 1., 0).unwrap();
        let file = workflow.add_file("input", 1000).unwrap();
        workflow.add_input_file(task, file).unwrap();
        (task, file)
    };
    cluster
        .borrow()
        .storage(storage)
        .unwrap()
        .borrow_mut()
        .store_file(file, 1000)
        .unwrap();

    let job = cluster
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(vec![task]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_no_events();

    let events = platform.events_of(job);
    assert_close(events[0].0, 5.);
    assert_eq!(
        events[0].1,
        WorkflowExecutionEvent::StandardJobFailed {
            job,
            service: mc,
            cause: FailureCause::NetworkTimeout {
                operation: NetworkOperation::Receiving,
                mailbox: "s".to_string(),
            },
        }
    );
}

#[test]
fn task_reads_inputs_and_writes_outputs() {
    let mut platform = Platform::new();
    let storage = platform.sim.add_storage("s", 1_000_000, 100.);
    let mc = platform
        .sim
        .add_multicore_service("multicore", &["host0"], Some(storage), MulticoreProperties::default())
        .unwrap();
    let cluster = platform.sim.cluster();
    let (task, input, output) = {
        let workflow = platform.sim.workflow();
        let mut workflow = workflow.borrow_mut();
        let task = workflow.add_task("task", 10., 1, 1, 1., 0).unwrap();
        let input = workflow.add_file("input", 100).unwrap();
        let output = workflow.add_file("output", 200).unwrap();
        workflow.add_input_file(task, input).unwrap();
        workflow.add_output_file(task, output).unwrap();
        (task, input, output)
    };
    let store = cluster.borrow().storage(storage).unwrap();
    store.borrow_mut().store_file(input, 100).unwrap();

    let job = cluster
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(vec![task]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_no_events();

    // 1s read, 10s compute, 2s write
    let events = platform.events_of(job);
    assert_close(events[0].0, 13.);
    assert_eq!(
        events[0].1,
        WorkflowExecutionEvent::StandardJobCompleted { job, service: mc }
    );
    assert!(store.borrow().has_file(output));
    assert_eq!(store.borrow().free_space(), 1_000_000 - 300);
}

#[test]
fn pilot_job_hosts_a_nested_service() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0", "host1"], MulticoreProperties::default());
    let cluster = platform.sim.cluster();

    let pilot = cluster
        .borrow_mut()
        .submit_pilot_job(
            mc,
            PilotJob {
                num_hosts: 1,
                cores_per_host: 4,
                ram_per_host: 0,
                duration: 50.,
            },
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_time(1.);

    let nested = cluster.borrow().pilot_service(pilot).unwrap();
    let now = platform.sim.time();
    assert_close(cluster.borrow().service_ttl(nested).unwrap(), 50. - now);
    assert_eq!(cluster.borrow().service_ttl(mc), None);
    let info = cluster.borrow().resource_information(nested).unwrap();
    assert_eq!(info.num_cores().values().sum::<u32>(), 4);
    let info = cluster.borrow().resource_information(mc).unwrap();
    assert_eq!(info.num_idle_cores().values().sum::<u32>(), 16);

    let task = platform
        .sim
        .workflow()
        .borrow_mut()
        .add_task("inside", 40., 1, 4, 1., 0)
        .unwrap();
    let job = cluster
        .borrow_mut()
        .submit_standard_job(
            nested,
            StandardJob::new(vec![task]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_no_events();

    let events = platform.events_of(job);
    assert_close(events[0].0, now + 10.);
    assert_eq!(
        events[0].1,
        WorkflowExecutionEvent::StandardJobCompleted {
            job,
            service: nested
        }
    );

    let pilot_events = platform.events_of(pilot);
    assert_eq!(pilot_events.len(), 2);
    assert_close(pilot_events[1].0, 50.);
    assert_eq!(
        pilot_events[1].1,
        WorkflowExecutionEvent::PilotJobExpired { job: pilot, service: mc }
    );
    assert!(!cluster.borrow().is_service_up(nested));
    let info = cluster.borrow().resource_information(mc).unwrap();
    assert_eq!(info.num_idle_cores().values().sum::<u32>(), 20);
}

#[test]
fn stopped_service_rejects_new_jobs() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0"], MulticoreProperties::default());
    let cluster = platform.sim.cluster();
    let task = platform
        .sim
        .workflow()
        .borrow_mut()
        .add_task("task", 100., 1, 1, 1., 0)
        .unwrap();
    let job = cluster
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(vec![task]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_time(10.);
    cluster.borrow_mut().stop_service(mc).unwrap();
    platform.sim.step_until_no_events();

    assert_eq!(
        platform.events_of(job)[0].1,
        WorkflowExecutionEvent::StandardJobFailed {
            job,
            service: mc,
            cause: FailureCause::service_down_compute(mc),
        }
    );
    assert_eq!(
        platform.sim.workflow().borrow().task(task).state(),
        TaskState::Failed
    );

    let result = cluster.borrow_mut().submit_standard_job(
        mc,
        StandardJob::new(vec![task]),
        ServiceArgs::new(),
        platform.wms_id,
    );
    assert_eq!(
        result,
        Err(SubmitError::Failure(FailureCause::service_down_compute(mc)))
    );
}

#[test]
fn tasks_with_parents_outside_the_job_are_rejected() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0"], MulticoreProperties::default());
    let cluster = platform.sim.cluster();
    let (a, b) = {
        let workflow = platform.sim.workflow();
        let mut workflow = workflow.borrow_mut();
        let a = workflow.add_task("a", 10., 1, 1, 1., 0).unwrap();
        let b = workflow.add_task("b", 10., 1, 1, 1., 0).unwrap();
        workflow.add_control_dependency(a, b).unwrap();
        (a, b)
    };

    let result = cluster.borrow_mut().submit_standard_job(
        mc,
        StandardJob::new(vec![b]),
        ServiceArgs::new(),
        platform.wms_id,
    );
    assert!(matches!(result, Err(SubmitError::InvalidArgument(_))));
    assert_eq!(
        platform.sim.workflow().borrow().task(b).state(),
        TaskState::NotReady
    );

    let job = cluster
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(vec![a, b]),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();
    platform.sim.step_until_no_events();
    assert_eq!(
        platform.events_of(job)[0].1,
        WorkflowExecutionEvent::StandardJobCompleted { job, service: mc }
    );
}

#[test]
fn failed_job_gives_back_every_core_and_byte() {
    let mut platform = Platform::new();
    let mc = platform.multicore(&["host0"], MulticoreProperties::default());
    let cluster = platform.sim.cluster();
    let tasks = {
        let workflow = platform.sim.workflow();
        let mut workflow = workflow.borrow_mut();
        vec![
            workflow.add_task("a", 100., 4, 4, 1., 1000).unwrap(),
            workflow.add_task("b", 100., 2, 2, 1., 500).unwrap(),
        ]
    };
    let job = cluster
        .borrow_mut()
        .submit_standard_job(
            mc,
            StandardJob::new(tasks),
            ServiceArgs::new(),
            platform.wms_id,
        )
        .unwrap();

    platform.sim.step_until_time(5.);
    let info = cluster.borrow().resource_information(mc).unwrap();
    assert_eq!(info.hosts[0].idle_cores, 4);
    assert_eq!(info.hosts[0].available_ram, 1_000_000 - 1500);

    assert!(cluster
        .borrow_mut()
        .inject_compute_thread_failure(mc, "host0")
        .unwrap());
    let info = cluster.borrow().resource_information(mc).unwrap();
    assert_eq!(info.hosts[0].idle_cores, 10);
    assert_eq!(info.hosts[0].available_ram, 1_000_000);
    assert_eq!(cluster.borrow().platform().num_waiting(), 0);

    // the abandoned computations still drain on the host
    platform.sim.step_until_no_events();
    let info = cluster.borrow().resource_information(mc).unwrap();
    assert_eq!(info.hosts[0].idle_cores, 10);
    assert_eq!(info.hosts[0].available_ram, 1_000_000);
    let events = platform.events_of(job);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].1,
        WorkflowExecutionEvent::StandardJobFailed {
            job,
            service: mc,
            cause: FailureCause::ComputeThreadHasDied,
        }
    );
}
