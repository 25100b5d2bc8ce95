use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use uthread::{
    MAX_THREADS, ThreadError,
    sync::{Mutex, OnceFlag, OnceState, once},
    thread::{self, BlockReason, ThreadId, ThreadState},
};

/// Yield until thread `tid` reaches `state`.
pub fn wait_for_state(tid: ThreadId, state: ThreadState) {
    for _ in 0..1000 {
        if thread::state_of(tid).ok() == Some(state) {
            return;
        }
        thread::yield_now().unwrap();
    }
    panic!(
        "thread {tid} is {:?}, expected {state:?}",
        thread::state_of(tid)
    );
}

pub fn create_and_join() {
    let live = thread::live_threads();
    let tids: Vec<_> = (0..5usize)
        .map(|i| thread::create(move || i * i).unwrap())
        .collect();
    assert_eq!(thread::live_threads(), live + 5);
    for tid in &tids {
        assert_eq!(thread::state_of(*tid).ok(), Some(ThreadState::Ready));
    }
    for (i, tid) in tids.iter().enumerate() {
        assert_eq!(thread::join(*tid).unwrap(), i * i);
        assert!(matches!(
            thread::state_of(*tid),
            Err(ThreadError::NoSuchThread(t)) if t == *tid
        ));
    }
    assert_eq!(thread::live_threads(), live);
    // Ids are never reused.
    let next = thread::create(|| 0).unwrap();
    assert!(tids.iter().all(|tid| *tid < next));
    thread::join(next).unwrap();
}

pub fn join_before_exit() {
    let tid = thread::create(|| {
        for _ in 0..5 {
            thread::yield_now().unwrap();
        }
        11
    })
    .unwrap();
    assert_eq!(thread::join(tid).unwrap(), 11);
}

pub fn join_after_exit() {
    let tid = thread::create(|| thread::exit(7)).unwrap();
    wait_for_state(tid, ThreadState::Finished);
    assert_eq!(thread::join(tid).unwrap(), 7);
    assert!(matches!(
        thread::join(tid),
        Err(ThreadError::NoSuchThread(t)) if t == tid
    ));
}

pub fn join_errors() {
    assert!(matches!(
        thread::join(thread::self_id()),
        Err(ThreadError::SelfJoin)
    ));
    assert!(matches!(
        thread::join(usize::MAX),
        Err(ThreadError::NoSuchThread(usize::MAX))
    ));

    let target = thread::create(|| {
        thread::suspend(thread::self_id()).unwrap();
        3
    })
    .unwrap();
    let joiner = thread::create(move || thread::join(target).unwrap() + 1).unwrap();
    wait_for_state(target, ThreadState::Blocked(BlockReason::Suspended));
    wait_for_state(joiner, ThreadState::Blocked(BlockReason::Join(target)));

    // Only one thread may wait for a thread.
    assert!(matches!(
        thread::join(target),
        Err(ThreadError::AlreadyJoined(t)) if t == target
    ));
    // A joiner is not woken by resume.
    assert!(matches!(
        thread::resume(joiner),
        Err(ThreadError::NotSuspended(t)) if t == joiner
    ));

    thread::resume(target).unwrap();
    assert_eq!(thread::join(joiner).unwrap(), 4);
    assert!(matches!(
        thread::state_of(target),
        Err(ThreadError::NoSuchThread(_))
    ));
}

pub fn join_after_target_finished() {
    let target = thread::create(|| 5).unwrap();
    let late = thread::create(move || match thread::join(target) {
        Err(ThreadError::AlreadyJoined(t)) if t == target => 1,
        _ => 0,
    })
    .unwrap();
    // The target finishes and wakes us, then the late joiner runs before we
    // do and finds the target finished but claimed.
    assert_eq!(thread::join(target).unwrap(), 5);
    assert_eq!(thread::join(late).unwrap(), 1);
    assert!(matches!(
        thread::state_of(target),
        Err(ThreadError::NoSuchThread(_))
    ));
}

pub fn join_deadlock() {
    let tid = thread::create(|| 0).unwrap();
    thread::suspend(tid).unwrap();
    // The only other thread is blocked, and the main thread waits for us.
    assert!(matches!(thread::join(tid), Err(ThreadError::Deadlock)));
    assert_eq!(thread::state_of(thread::self_id()).ok(), Some(ThreadState::Running));
    thread::resume(tid).unwrap();
    assert_eq!(thread::join(tid).unwrap(), 0);
}

pub fn panicked_thread() {
    let live = thread::live_threads();
    let tid = thread::create(|| panic!("intended panic")).unwrap();
    assert!(matches!(
        thread::join(tid),
        Err(ThreadError::Panicked(t)) if t == tid
    ));
    assert_eq!(thread::live_threads(), live);
}

pub fn thread_limit() {
    let room = MAX_THREADS - thread::live_threads();
    let tids: Vec<_> = (0..room)
        .map(|i| thread::create(move || i).unwrap())
        .collect();
    assert_eq!(thread::live_threads(), MAX_THREADS);
    assert!(matches!(
        thread::create(|| 0),
        Err(ThreadError::TooManyThreads { max: MAX_THREADS })
    ));
    for (i, tid) in tids.into_iter().enumerate() {
        assert_eq!(thread::join(tid).unwrap(), i);
    }
    // Joined threads free their slots.
    thread::join(thread::create(|| 0).unwrap()).unwrap();
}

pub fn suspend_and_resume() {
    let progress = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let tid = {
        let (progress, stop) = (progress.clone(), stop.clone());
        thread::create(move || {
            while !stop.load(Ordering::SeqCst) {
                progress.fetch_add(1, Ordering::SeqCst);
                thread::yield_now().unwrap();
            }
            0
        })
        .unwrap()
    };
    thread::yield_now().unwrap();
    thread::suspend(tid).unwrap();
    assert_eq!(thread::state_of(tid).ok(), Some(ThreadState::Blocked(BlockReason::Suspended)));
    // Suspending twice is harmless, and one resume undoes it.
    thread::suspend(tid).unwrap();

    let seen = progress.load(Ordering::SeqCst);
    for _ in 0..10 {
        thread::yield_now().unwrap();
    }
    assert_eq!(progress.load(Ordering::SeqCst), seen);

    thread::resume(tid).unwrap();
    assert_eq!(thread::state_of(tid).ok(), Some(ThreadState::Ready));
    assert!(matches!(
        thread::resume(tid),
        Err(ThreadError::NoSuchThread(t)) if t == tid
    ));
    thread::yield_now().unwrap();
    assert!(progress.load(Ordering::SeqCst) > seen);

    stop.store(true, Ordering::SeqCst);
    thread::join(tid).unwrap();
    assert!(matches!(
        thread::suspend(tid),
        Err(ThreadError::NoSuchThread(_))
    ));
}

pub fn self_suspend_deadlock() {
    // Every other thread is blocked: the main thread joins us.
    assert!(matches!(
        thread::suspend(thread::self_id()),
        Err(ThreadError::Deadlock)
    ));
    assert_eq!(thread::state_of(thread::self_id()).ok(), Some(ThreadState::Running));
}

pub fn yield_order_is_fifo() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let tids: Vec<_> = ['A', 'B', 'C']
        .into_iter()
        .map(|name| {
            let log = log.clone();
            thread::create(move || {
                for _ in 0..3 {
                    log.lock().push(name);
                    thread::yield_now().unwrap();
                }
                0
            })
            .unwrap()
        })
        .collect();
    for tid in tids {
        thread::join(tid).unwrap();
    }
    let log: String = log.lock().iter().collect();
    assert_eq!(log, "ABCABCABC");
}

pub fn quantum_accounting() {
    let me = thread::self_id();
    let (total_before, mine_before) = (thread::total_quantums(), thread::quantums_of(me).unwrap());
    let tids: Vec<_> = [2u64, 3, 4]
        .into_iter()
        .map(|yields| {
            thread::create(move || {
                for _ in 0..yields {
                    thread::yield_now().unwrap();
                }
                0
            })
            .unwrap()
        })
        .collect();
    for tid in &tids {
        wait_for_state(*tid, ThreadState::Finished);
    }
    let workers: Vec<u64> = tids
        .iter()
        .map(|tid| thread::quantums_of(*tid).unwrap())
        .collect();
    let total = thread::total_quantums();
    let mine = thread::quantums_of(me).unwrap();

    // Each yield and the exit complete one quantum.
    for (used, yields) in workers.iter().zip([2u64, 3, 4]) {
        assert!(*used > yields, "{used} quantums for {yields} yields");
    }
    assert_eq!(
        total - total_before,
        workers.iter().sum::<u64>() + (mine - mine_before)
    );
    for tid in tids {
        thread::join(tid).unwrap();
    }
    assert!(matches!(
        thread::quantums_of(usize::MAX),
        Err(ThreadError::NoSuchThread(_))
    ));
}

pub fn once_runs_exactly_once() {
    static FLAG: OnceFlag = OnceFlag::new();
    static RUNS: AtomicUsize = AtomicUsize::new(0);

    let tids: Vec<_> = (0..8)
        .map(|_| {
            thread::create(|| {
                once(&FLAG, || {
                    RUNS.fetch_add(1, Ordering::SeqCst);
                    // Let the others arrive while the initializer runs.
                    thread::yield_now().unwrap();
                });
                assert!(FLAG.is_completed());
                0
            })
            .unwrap()
        })
        .collect();
    for tid in tids {
        thread::join(tid).unwrap();
    }
    once(&FLAG, || unreachable!());
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);
}

pub fn once_after_panic() {
    static FLAG: OnceFlag = OnceFlag::new();

    let tid = thread::create(|| {
        once(&FLAG, || panic!("intended panic"));
        0
    })
    .unwrap();
    assert!(matches!(thread::join(tid), Err(ThreadError::Panicked(_))));
    assert_eq!(FLAG.state(), OnceState::NotExecuted);

    let mut ran = false;
    once(&FLAG, || ran = true);
    assert!(ran);
    assert_eq!(FLAG.state(), OnceState::Executed);
}
