extern crate env_logger;
extern crate fray;
extern crate rand;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};

use fray::sched::{self, JobDesc, JobStatus, SchedParams};

// The scheduler is a process-wide singleton; tests take this lock so their
// setup/discard pairs never interleave.
static SCHED_LOCK: Mutex<()> = Mutex::new(());

struct Teardown;

impl Drop for Teardown {
    fn drop(&mut self) {
        sched::discard();
    }
}

// Flips a gate flag on drop so a failing assertion cannot leave cooperative
// gate jobs spinning forever through teardown.
struct ReleaseOnDrop(Arc<AtomicBool>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn with_sched<F: FnOnce()>(params: SchedParams, f: F) {
    let _guard = SCHED_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::try_init();

    sched::setup(params).unwrap();
    let teardown = Teardown;
    f();
    drop(teardown);
}

fn test_params(workers: usize) -> SchedParams {
    SchedParams {
        workers: Some(workers),
        ..Default::default()
    }
}

// S1: a root producing an array, 40 children summing disjoint windows, one
// reducer over the partial sums.
#[test]
fn fan_out_fan_in() {
    with_sched(test_params(8), || {
        const LEN: usize = 10_000;
        const CHILDREN: usize = 40;
        const WINDOW: usize = LEN / CHILDREN;

        let data = Arc::new(Mutex::new(Vec::new()));
        let partials: Arc<Vec<AtomicU64>> =
            Arc::new((0..CHILDREN).map(|_| AtomicU64::new(0)).collect());
        let result = Arc::new(AtomicU64::new(0));

        let mut descs = Vec::new();
        let mut edges = Vec::new();

        let root_data = Arc::clone(&data);
        descs.push(JobDesc::new("produce", move || {
            let mut data = root_data.lock().unwrap();
            *data = (0..LEN as u64).collect();
        }));

        for child in 0..CHILDREN {
            let data = Arc::clone(&data);
            let partials = Arc::clone(&partials);
            descs.push(JobDesc::new("sum-window", move || {
                let data = data.lock().unwrap();
                let from = child * WINDOW;
                let sum: u64 = data[from..from + WINDOW].iter().sum();
                partials[child].store(sum, Ordering::SeqCst);
            }));
            edges.push((0, child + 1));
        }

        let reduce_partials = Arc::clone(&partials);
        let reduce_result = Arc::clone(&result);
        descs.push(JobDesc::new("reduce", move || {
            let total = reduce_partials
                .iter()
                .map(|p| p.load(Ordering::SeqCst))
                .sum();
            reduce_result.store(total, Ordering::SeqCst);
        }));
        for child in 0..CHILDREN {
            edges.push((child + 1, CHILDREN + 1));
        }

        let handles = sched::submit_batch(descs, &edges).unwrap();
        sched::wait(handles[CHILDREN + 1]);

        let expected = (LEN as u64 - 1) * LEN as u64 / 2;
        assert_eq!(result.load(Ordering::SeqCst), expected);
    });
}

// S2: diamond ordering, verified through both body-recorded clocks and the
// profiler's frame records.
#[test]
fn diamond_ordering() {
    with_sched(test_params(4), || {
        #[derive(Default)]
        struct Span {
            start: Mutex<Option<Instant>>,
            end: Mutex<Option<Instant>>,
        }

        let spans: Arc<Vec<Span>> = Arc::new((0..4).map(|_| Span::default()).collect());
        let body = |index: usize, spans: &Arc<Vec<Span>>| {
            let spans = Arc::clone(spans);
            move || {
                *spans[index].start.lock().unwrap() = Some(Instant::now());
                thread::sleep(Duration::from_millis(2));
                *spans[index].end.lock().unwrap() = Some(Instant::now());
            }
        };

        sched::frame_start();

        let descs = vec![
            JobDesc::new("r", body(0, &spans)),
            JobDesc::new("a", body(1, &spans)),
            JobDesc::new("b", body(2, &spans)),
            JobDesc::new("j", body(3, &spans)),
        ];
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3)];
        let handles = sched::submit_batch(descs, &edges).unwrap();
        sched::wait(handles[3]);

        let start = |i: usize| spans[i].start.lock().unwrap().unwrap();
        let end = |i: usize| spans[i].end.lock().unwrap().unwrap();

        assert!(end(0) <= start(1));
        assert!(end(0) <= start(2));
        assert!(start(3) >= end(1));
        assert!(start(3) >= end(2));

        sched::frame_end();
        sched::with_frame(|records| {
            assert_eq!(records.len(), 4);
            for name in &["r", "a", "b", "j"] {
                let record = records
                    .iter()
                    .find(|r| r.name == *name)
                    .unwrap_or_else(|| panic!("no record for {}", name));
                assert!(record.end >= record.start);
            }
        });
    });
}

// S3: a deep linear chain writes strictly ascending indices.
#[test]
fn linear_chain() {
    with_sched(test_params(4), || {
        const DEPTH: usize = 1_000;

        let order = Arc::new(Mutex::new(Vec::with_capacity(DEPTH)));
        let mut previous = None;
        for index in 0..DEPTH {
            let order = Arc::clone(&order);
            let handle = sched::schedule(
                "link",
                move || order.lock().unwrap().push(index),
                previous,
            )
            .unwrap();
            previous = Some(handle);
        }

        sched::wait(previous.unwrap());

        let order = order.lock().unwrap();
        assert_eq!(order.len(), DEPTH);
        assert!(order.windows(2).all(|w| w[0] + 1 == w[1]));
    });
}

// S4: a cooperative job yields five times while compute jobs keep flowing.
#[test]
fn cooperative_yield() {
    with_sched(test_params(4), || {
        let observations = Arc::new(Mutex::new(Vec::new()));
        let resumptions = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicUsize::new(0));

        let step_observations = Arc::clone(&observations);
        let step_resumptions = Arc::clone(&resumptions);
        let step_completions = Arc::clone(&completions);
        let cooperative = sched::schedule_step(
            "cooperative",
            move || {
                let seen = step_resumptions.fetch_add(1, Ordering::SeqCst) + 1;
                step_observations.lock().unwrap().push(seen);
                if seen < 6 {
                    JobStatus::Yield
                } else {
                    step_completions.fetch_add(1, Ordering::SeqCst);
                    JobStatus::Complete
                }
            },
            None,
        )
        .unwrap();

        let computed = Arc::new(AtomicUsize::new(0));
        let mut compute = Vec::new();
        for _ in 0..100 {
            let computed = Arc::clone(&computed);
            compute.push(
                sched::schedule(
                    "compute",
                    move || {
                        computed.fetch_add(1, Ordering::SeqCst);
                    },
                    None,
                )
                .unwrap(),
            );
        }

        sched::wait_all(&compute);
        sched::wait(cooperative);

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(computed.load(Ordering::SeqCst), 100);
        assert_eq!(*observations.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    });
}

// S5: stress the thieves with no-op jobs submitted from the main thread.
#[test]
fn stealer_stress() {
    with_sched(test_params(4), || {
        const JOBS: usize = 100_000;

        let executed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(JOBS);
        for _ in 0..JOBS {
            loop {
                let executed = Arc::clone(&executed);
                match sched::schedule(
                    "noop",
                    move || {
                        executed.fetch_add(1, Ordering::Relaxed);
                    },
                    None,
                ) {
                    Ok(handle) => {
                        handles.push(handle);
                        break;
                    }
                    // Table or queues saturated; let the workers drain.
                    Err(_) => thread::yield_now(),
                }
            }
        }

        sched::wait_all(&handles);
        assert_eq!(executed.load(Ordering::SeqCst), JOBS);

        let stats = sched::stats();
        assert_eq!(stats.submitted, stats.completed + stats.cancelled);
        assert_eq!(stats.outstanding, 0);

        let stolen: u64 = stats.workers[1..]
            .iter()
            .map(|w| w.steals_succeeded)
            .sum();
        assert!(stolen > 0, "no worker ever stole: {:?}", stats);
    });
}

// S6: a handle kept across its slot's retirement and reuse stays settled
// and never touches the new occupant.
#[test]
fn stale_handle_is_settled() {
    with_sched(test_params(2), || {
        let first = sched::schedule("short-lived", || {}, None).unwrap();
        sched::wait(first);

        // The freed slot is on top of the free list, so the next job takes
        // it over with a bumped generation.
        let release = Arc::new(AtomicBool::new(false));
        let _release_guard = ReleaseOnDrop(Arc::clone(&release));
        let gate_release = Arc::clone(&release);
        let occupant = sched::schedule_step(
            "occupant",
            move || {
                if gate_release.load(Ordering::SeqCst) {
                    JobStatus::Complete
                } else {
                    JobStatus::Yield
                }
            },
            None,
        )
        .unwrap();

        assert_eq!(occupant.index(), first.index());
        assert_ne!(occupant.generation(), first.generation());

        // The stale handle reports completion immediately and waiting on it
        // is a no-op, even though the slot is busy again.
        assert!(sched::is_complete(first));
        sched::wait(first);
        assert!(!sched::is_complete(occupant));

        release.store(true, Ordering::SeqCst);
        sched::wait(occupant);
        assert!(sched::is_complete(occupant));
    });
}

// Property 1 + 2: randomized DAGs lose no work and honor every edge.
#[test]
fn random_dags_converge() {
    with_sched(test_params(4), || {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        for round in 0..4 {
            let nodes: usize = 500 + round * 250;
            let executed = Arc::new(AtomicUsize::new(0));
            let spans: Arc<Vec<(AtomicU64, AtomicU64)>> = Arc::new(
                (0..nodes)
                    .map(|_| (AtomicU64::new(0), AtomicU64::new(0)))
                    .collect(),
            );

            let epoch = Instant::now();
            let mut descs = Vec::with_capacity(nodes);
            let mut edges = Vec::new();
            for index in 0..nodes {
                let executed = Arc::clone(&executed);
                let spans = Arc::clone(&spans);
                descs.push(JobDesc::new("node", move || {
                    spans[index]
                        .0
                        .store(epoch.elapsed().as_nanos() as u64 + 1, Ordering::SeqCst);
                    executed.fetch_add(1, Ordering::SeqCst);
                    spans[index]
                        .1
                        .store(epoch.elapsed().as_nanos() as u64 + 1, Ordering::SeqCst);
                }));

                // Up to three prerequisites among earlier nodes.
                if index > 0 {
                    for _ in 0..rng.gen_range(0, 4) {
                        let pre = rng.gen_range(0, index);
                        if !edges.contains(&(pre, index)) {
                            edges.push((pre, index));
                        }
                    }
                }
            }

            let handles = sched::submit_batch(descs, &edges).unwrap();
            sched::wait_all(&handles);

            assert_eq!(executed.load(Ordering::SeqCst), nodes);
            for &(pre, dep) in &edges {
                let pre_end = spans[pre].1.load(Ordering::SeqCst);
                let dep_start = spans[dep].0.load(Ordering::SeqCst);
                assert!(pre_end != 0 && dep_start != 0);
                assert!(
                    dep_start >= pre_end,
                    "edge ({}, {}) violated: {} < {}",
                    pre,
                    dep,
                    dep_start,
                    pre_end
                );
            }
        }
    });
}

// Property 5: the group continuation fires exactly once, strictly after
// every member.
#[test]
fn group_closure() {
    with_sched(test_params(4), || {
        const MEMBERS: usize = 32;

        let finished_members = Arc::new(AtomicUsize::new(0));
        let continuation_runs = Arc::new(AtomicUsize::new(0));
        let observed_at_continuation = Arc::new(AtomicUsize::new(usize::max_value()));

        let group = sched::group_create(4 * 1_024);

        let gate = Arc::new(AtomicBool::new(false));
        let _gate_guard = ReleaseOnDrop(Arc::clone(&gate));
        let gate_handle = {
            let gate = Arc::clone(&gate);
            sched::schedule_step(
                "gate",
                move || {
                    if gate.load(Ordering::SeqCst) {
                        JobStatus::Complete
                    } else {
                        JobStatus::Yield
                    }
                },
                None,
            )
            .unwrap()
        };

        for _ in 0..MEMBERS {
            let finished = Arc::clone(&finished_members);
            let handle = sched::schedule(
                "member",
                move || {
                    let scratch = sched::with_group_arena(group, |arena| arena.alloc(128));
                    assert!(scratch.unwrap().is_some());
                    finished.fetch_add(1, Ordering::SeqCst);
                },
                Some(gate_handle),
            )
            .unwrap();
            sched::group_add(group, handle);
        }

        let continuation = {
            let runs = Arc::clone(&continuation_runs);
            let finished = Arc::clone(&finished_members);
            let observed = Arc::clone(&observed_at_continuation);
            sched::group_set_continuation(group, "continuation", move || {
                observed.store(finished.load(Ordering::SeqCst), Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        sched::group_submit(group);
        gate.store(true, Ordering::SeqCst);
        sched::group_wait(group);
        sched::wait(continuation);

        assert_eq!(finished_members.load(Ordering::SeqCst), MEMBERS);
        // The barrier closed, so the continuation saw every member done.
        assert_eq!(continuation_runs.load(Ordering::SeqCst), 1);
        assert_eq!(observed_at_continuation.load(Ordering::SeqCst), MEMBERS);

        sched::group_destroy(group);
        sched::group_wait(group); // destroyed groups count as complete
    });
}

// Property 7: a job waiting on a pending job keeps its worker executing
// other work instead of blocking the thread.
#[test]
fn wait_inside_job_helps() {
    with_sched(test_params(2), || {
        let release = Arc::new(AtomicBool::new(false));
        let _release_guard = ReleaseOnDrop(Arc::clone(&release));
        let waiter_entered = Arc::new(AtomicBool::new(false));
        let waiter_done = Arc::new(AtomicBool::new(false));

        let gate = {
            let release = Arc::clone(&release);
            sched::schedule_step(
                "gate",
                move || {
                    if release.load(Ordering::SeqCst) {
                        JobStatus::Complete
                    } else {
                        JobStatus::Yield
                    }
                },
                None,
            )
            .unwrap()
        };
        let blocked = sched::schedule("blocked", || {}, Some(gate)).unwrap();

        let waiter = {
            let entered = Arc::clone(&waiter_entered);
            let done = Arc::clone(&waiter_done);
            sched::schedule(
                "waiter",
                move || {
                    entered.store(true, Ordering::SeqCst);
                    sched::wait(blocked);
                    done.store(true, Ordering::SeqCst);
                },
                None,
            )
            .unwrap()
        };

        while !waiter_entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        // The pool's only spawned worker is inside `wait` now. These jobs
        // can only finish if that wait helps; the main thread deliberately
        // polls without helping.
        let computed = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let computed = Arc::clone(&computed);
            loop {
                let c = Arc::clone(&computed);
                if sched::schedule(
                    "compute",
                    move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    },
                    None,
                )
                .is_ok()
                {
                    break;
                }
                thread::yield_now();
            }
        }

        let deadline = Instant::now() + Duration::from_secs(30);
        while computed.load(Ordering::SeqCst) < 50 {
            assert!(Instant::now() < deadline, "compute jobs starved");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!waiter_done.load(Ordering::SeqCst));

        release.store(true, Ordering::SeqCst);
        sched::wait(waiter);
        assert!(waiter_done.load(Ordering::SeqCst));
    });
}

// A plain job can suspend mid-body with yield_now and resumes on the same
// worker with its stack intact.
#[test]
fn fiber_yield_now() {
    with_sched(test_params(2), || {
        let progress = Arc::new(AtomicUsize::new(0));
        let resumed_on = Arc::new(Mutex::new(Vec::new()));

        let yielding = {
            let progress = Arc::clone(&progress);
            let resumed_on = Arc::clone(&resumed_on);
            sched::schedule(
                "yielding",
                move || {
                    // Local state across suspensions proves the stack
                    // survives each yield.
                    let mut local = 0;
                    for step in 1..=5 {
                        local += step;
                        progress.store(step, Ordering::SeqCst);
                        resumed_on
                            .lock()
                            .unwrap()
                            .push(sched::current_worker_id().unwrap());
                        sched::yield_now();
                    }
                    assert_eq!(local, 15);
                    progress.store(6, Ordering::SeqCst);
                },
                None,
            )
            .unwrap()
        };

        let mut noise = Vec::new();
        for _ in 0..32 {
            noise.push(sched::schedule("noise", || {}, None).unwrap());
        }

        sched::wait(yielding);
        sched::wait_all(&noise);

        assert_eq!(progress.load(Ordering::SeqCst), 6);

        // Suspended fibers never migrate: every resumption observed the
        // same worker.
        let resumed_on = resumed_on.lock().unwrap();
        assert_eq!(resumed_on.len(), 5);
        assert!(resumed_on.iter().all(|&w| w == resumed_on[0]));

        let stats = sched::stats();
        let yields: u64 = stats.workers.iter().map(|w| w.yields).sum();
        assert!(yields >= 5, "expected suspensions, stats: {:?}", stats);
    });
}

// Children run after their parent and keep a back-reference to it.
#[test]
fn hierarchical_spawn() {
    with_sched(test_params(4), || {
        let order = Arc::new(Mutex::new(Vec::new()));

        let parent = {
            let order = Arc::clone(&order);
            sched::schedule(
                "parent",
                move || {
                    order.lock().unwrap().push("parent");
                    thread::sleep(Duration::from_millis(2));
                },
                None,
            )
            .unwrap()
        };

        let child = {
            let order = Arc::clone(&order);
            sched::spawn_child(parent, "child", move || {
                order.lock().unwrap().push("child");
            })
            .unwrap()
        };

        assert_eq!(sched::parent_of(child), Some(parent));

        sched::wait(child);
        assert_eq!(*order.lock().unwrap(), vec!["parent", "child"]);
    });
}

// Queries about the executing context from inside and outside job bodies.
#[test]
fn context_queries() {
    with_sched(test_params(2), || {
        // The main thread is promoted to worker 0 but runs no job.
        assert_eq!(sched::current_worker_id(), Some(0));
        assert_eq!(sched::current_job(), None);

        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let handle = sched::schedule(
            "introspect",
            move || {
                *slot.lock().unwrap() = Some((sched::current_worker_id(), sched::current_job()));
            },
            None,
        )
        .unwrap();
        sched::wait(handle);

        let (worker, job) = observed.lock().unwrap().take().unwrap();
        assert!(worker.is_some());
        assert_eq!(job, Some(handle));
    });
}

// Submissions from a thread that is not a worker at all.
#[test]
fn foreign_thread_submission() {
    with_sched(test_params(2), || {
        let executed = Arc::new(AtomicUsize::new(0));

        let outside = {
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                let mut handles = Vec::new();
                for _ in 0..64 {
                    let executed = Arc::clone(&executed);
                    handles.push(
                        sched::schedule(
                            "outsider",
                            move || {
                                executed.fetch_add(1, Ordering::SeqCst);
                            },
                            None,
                        )
                        .unwrap(),
                    );
                }
                sched::wait_all(&handles);
            })
        };

        outside.join().unwrap();
        assert_eq!(executed.load(Ordering::SeqCst), 64);
    });
}
