use ecsearch::grammar::Grammar;
use ecsearch::library::arithmetic;
use ecsearch::protocol::{SolverRequest, Window};
use ecsearch::task::{Example, Task};
use ecsearch::types::tint;
use ecsearch::value::Value;
use ecsearch::worker::{Completion, ProcessLauncher, Reply, WorkerLauncher};
use std::sync::mpsc;
use std::time::{Duration, Instant};

fn request() -> SolverRequest {
    let task = Task::new(
        "two",
        tint(),
        vec![Example {
            inputs: vec![],
            output: Value::Int(2),
        }],
    );
    let window = Window {
        lower_bound: 0.0,
        upper_bound: 6.0,
        budget_increment: 1.5,
    };
    SolverRequest::for_job(&Grammar::uniform(&arithmetic()), &[(&task, 1)], window, 10.0, 1, None).unwrap()
}

fn run(launcher: ProcessLauncher, request: SolverRequest) -> Completion {
    let (sender, receiver) = mpsc::channel();
    launcher.launch(request, Reply::new(7, sender)).unwrap();
    receiver.recv_timeout(Duration::from_secs(30)).unwrap()
}

fn worker(library: &str) -> ProcessLauncher {
    ProcessLauncher::new(
        env!("CARGO_BIN_EXE_ecsearch"),
        vec!["worker".to_string(), "--library".to_string(), library.to_string()],
    )
}

#[test]
fn test_child_process_solves_request() {
    let completion = run(worker("arithmetic"), request());
    assert_eq!(completion.worker, 7);
    let response = completion.outcome.unwrap();
    let solutions = &response["two"];
    assert_eq!(solutions.len(), 1);
    assert_eq!(solutions[0].program, "(+ 1 1)");
    assert_eq!(solutions[0].log_likelihood, 0.0);
}

#[test]
fn test_child_failure_carries_stderr() {
    let completion = run(worker("no-such-library"), request());
    let failure = completion.outcome.unwrap_err();
    assert!(failure.message.contains("exited"), "{}", failure.message);
    assert!(failure.trace.contains("unknown library"), "{}", failure.trace);
}

#[cfg(unix)]
#[test]
fn test_overdue_child_is_killed() {
    let mut request = request();
    request.timeout = 0.05;
    let launcher = ProcessLauncher::new("sleep", vec!["5".to_string()]).with_kill_grace(Duration::ZERO);
    let completion = run(launcher, request);
    assert!(completion.outcome.unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn test_cancel_kills_running_children() {
    let launcher = ProcessLauncher::new("sleep", vec!["30".to_string()]);
    let (sender, receiver) = mpsc::channel();
    let started = Instant::now();
    launcher.launch(request(), Reply::new(1, sender.clone())).unwrap();
    launcher.launch(request(), Reply::new(2, sender)).unwrap();
    launcher.cancel();

    for _ in 0..2 {
        let completion = receiver.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(completion.outcome.unwrap().is_empty());
    }
    assert!(started.elapsed() < Duration::from_secs(10));

    // Children launched after a cancellation run normally.
    let launcher = worker("arithmetic");
    launcher.cancel();
    let completion = run(launcher, request());
    assert!(!completion.outcome.unwrap()["two"].is_empty());
}
