mod driver;
mod sync;
mod thread;

use driver::TestDriver;
use tracing_subscriber::EnvFilter;

/// Quantum of the grader, long enough that preemption never interferes with
/// the interleavings the cases set up.
const QUANTUM_USECS: u64 = 100_000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    uthread::init(QUANTUM_USECS).expect("Failed to initialize uthread");
    TestDriver::start([
        // Thread lifecycle.
        &thread::create_and_join,
        &thread::join_before_exit,
        &thread::join_after_exit,
        &thread::join_errors,
        &thread::join_after_target_finished,
        &thread::join_deadlock,
        &thread::panicked_thread,
        &thread::thread_limit,
        &thread::suspend_and_resume,
        &thread::self_suspend_deadlock,
        &thread::yield_order_is_fifo,
        &thread::quantum_accounting,
        &thread::once_runs_exactly_once,
        &thread::once_after_panic,
        // Sync
        &sync::lock::counter,
        &sync::lock::parking,
        &sync::lock::fifo_handoff,
        &sync::lock::unlock_by_non_owner,
        &sync::mutex::smoke,
        &sync::condition_variable::wait_returns_with_lock,
        &sync::condition_variable::broadcast,
        &sync::condition_variable::bounded_buffer,
        &sync::spinlock::counter,
        // End to end.
        &scenario::init_errors,
        &scenario::three_threads,
    ]);
}
