//! Test driver.
//!
//! Every test case runs in a thread of its own while the main thread waits in
//! `join`. A case passes if its thread returns normally and fails if it
//! panics.
use std::collections::BTreeSet;
use uthread::thread;

pub trait TestCase
where
    Self: Sync + Send,
{
    fn name(&'static self) -> &'static str;
    fn run(&'static self) -> bool;
}

impl<T> TestCase for T
where
    T: Fn() + Send + Sync + 'static,
{
    fn name(&'static self) -> &'static str {
        core::any::type_name::<T>()
    }

    fn run(&'static self) -> bool {
        print!("test {} ... ", self.name());
        let result = thread::create(move || {
            self();
            0
        })
        .and_then(thread::join);
        match result {
            Ok(0) => {
                println!("ok");
                true
            }
            Ok(code) => {
                println!("FAILED (returned {code})");
                false
            }
            Err(e) => {
                println!("FAILED ({e})");
                false
            }
        }
    }
}

/// A driver for running tests.
pub struct TestDriver;

impl TestDriver {
    /// Run the given tests and exit the process with the overall result.
    ///
    /// Arguments on the command line select test cases by name, without the
    /// crate prefix, e.g. `thread::join_errors`.
    pub fn start<const TC: usize>(tests: [&'static dyn TestCase; TC]) -> ! {
        let filter = std::env::args()
            .skip(1)
            .filter(|arg| !arg.starts_with('-'))
            .collect::<BTreeSet<_>>();
        let tests = tests
            .into_iter()
            .filter(|test| {
                let name = test.name();
                let r = name.split("::").next().map(|n| n.len() + 2).unwrap_or(0);
                filter.is_empty() || filter.contains(&name[r..])
            })
            .collect::<Vec<_>>();
        let (total, mut succ) = (tests.len(), 0);
        println!(
            "Running {} test{}",
            total,
            if total == 1 { "" } else { "s" }
        );
        for test in tests {
            if test.run() {
                succ += 1;
            }
        }
        println!(
            "test result: {}. {} passed; {} failed",
            if total == succ { "ok" } else { "FAILED" },
            succ,
            total - succ
        );
        std::process::exit(if total == succ { 0 } else { 1 })
    }
}
