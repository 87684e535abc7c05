//! End-to-end interception tests against live functions in this binary.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use wiretap::hook::{HookDefinition, ResolvedHook};
use wiretap::intercept::{self, AttachError, InterceptionHandle};

/// Installs `definition` at `address` and unwraps the handle.
fn install_at(definition: HookDefinition, address: usize) -> InterceptionHandle {
    // Safety: every target in this file is a private test function, and no
    // other thread executes it while hooks go in or out
    unsafe { intercept::install(ResolvedHook::new(definition, address)).unwrap() }
}

#[inline(never)]
extern "C" fn mix3(a: u64, b: u64, c: u64) -> u64 {
    let a = black_box(a);
    a.wrapping_mul(2)
        .wrapping_add(b.wrapping_mul(3))
        .wrapping_add(c.wrapping_mul(5))
}

#[test]
/// Tests that `on_enter` sees the live arguments and `on_leave` the return
/// value, while the target computes exactly what it always did
fn test_arguments_and_return_value() {
    let f: extern "C" fn(u64, u64, u64) -> u64 = black_box(mix3);

    let entered = Arc::new(Mutex::new(Vec::new()));
    let left = Arc::new(Mutex::new(Vec::new()));
    let definition = HookDefinition::new("mix3", "mix3")
        .on_enter({
            let entered = Arc::clone(&entered);
            move |context| {
                let args: Vec<u64> = (0..3)
                    .map(|i| context.arg(i).unwrap().to_u64())
                    .collect();
                entered.lock().unwrap().push(args);
            }
        })
        .on_leave({
            let left = Arc::clone(&left);
            move |context| {
                left.lock()
                    .unwrap()
                    .push(context.return_value().unwrap().to_u64());
            }
        });
    let handle = install_at(definition, f as usize);

    let result = f(black_box(7), black_box(9), black_box(11));
    assert_eq!(result, 7 * 2 + 9 * 3 + 11 * 5);

    assert_eq!(*entered.lock().unwrap(), [vec![7, 9, 11]]);
    assert_eq!(*left.lock().unwrap(), [result]);

    handle.uninstall();
}

static ENTER_MARK: AtomicU64 = AtomicU64::new(0);
static BODY_MARK: AtomicU64 = AtomicU64::new(0);

#[inline(never)]
extern "C" fn marked(x: u64) -> u64 {
    BODY_MARK.store(55, Ordering::SeqCst);
    ENTER_MARK.load(Ordering::SeqCst).wrapping_add(x)
}

#[test]
/// Tests that `on_enter` runs before the target body and `on_leave` after it
fn test_callback_ordering_around_body() {
    let f: extern "C" fn(u64) -> u64 = black_box(marked);

    let leave_saw_body = Arc::new(AtomicU64::new(0));
    let definition = HookDefinition::new("marked", "marked")
        .on_enter(|_| {
            ENTER_MARK.store(100, Ordering::SeqCst);
        })
        .on_leave({
            let leave_saw_body = Arc::clone(&leave_saw_body);
            move |_| {
                leave_saw_body.store(BODY_MARK.load(Ordering::SeqCst), Ordering::SeqCst);
            }
        });
    let handle = install_at(definition, f as usize);

    // the body reads what on_enter stored, so enter must have run first
    assert_eq!(f(black_box(1)), 101);
    // and on_leave read what the body stored
    assert_eq!(leave_saw_body.load(Ordering::SeqCst), 55);

    handle.uninstall();
}

#[inline(never)]
#[allow(clippy::too_many_arguments)]
extern "C" fn sum8(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64, g: u64, h: u64) -> u64 {
    a.wrapping_add(b)
        .wrapping_add(c)
        .wrapping_add(d)
        .wrapping_add(e)
        .wrapping_add(f)
        .wrapping_add(g)
        .wrapping_add(h)
}

#[test]
/// Tests that arguments past the sixth are read from the caller's stack
fn test_stack_arguments() {
    let f: extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64) -> u64 = black_box(sum8);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let definition = HookDefinition::new("sum8", "sum8").on_enter({
        let seen = Arc::clone(&seen);
        move |context| {
            let args: Vec<u64> = (0..8)
                .map(|i| context.arg(i).unwrap().to_u64())
                .collect();
            seen.lock().unwrap().push(args);
        }
    });
    let handle = install_at(definition, f as usize);

    let result = f(
        black_box(1),
        black_box(2),
        black_box(3),
        black_box(4),
        black_box(5),
        black_box(6),
        black_box(7),
        black_box(8),
    );
    assert_eq!(result, 36);
    assert_eq!(*seen.lock().unwrap(), [vec![1, 2, 3, 4, 5, 6, 7, 8]]);

    handle.uninstall();
}

#[inline(never)]
extern "C" fn alpha(x: u64) -> u64 {
    x.wrapping_mul(0x9e37_79b9).rotate_left(7)
}

#[inline(never)]
extern "C" fn beta(x: u64) -> u64 {
    x.wrapping_add(0x1234_5678).rotate_right(3)
}

#[test]
/// Tests that hooks on different targets fire independently
fn test_independent_hooks() {
    let fa: extern "C" fn(u64) -> u64 = black_box(alpha);
    let fb: extern "C" fn(u64) -> u64 = black_box(beta);

    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));
    let handle_a = install_at(
        HookDefinition::new("alpha", "alpha").on_enter({
            let hits = Arc::clone(&hits_a);
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }),
        fa as usize,
    );
    let handle_b = install_at(
        HookDefinition::new("beta", "beta").on_enter({
            let hits = Arc::clone(&hits_b);
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }),
        fb as usize,
    );

    fa(black_box(1));
    fb(black_box(2));
    fb(black_box(3));
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 2);

    // removing one leaves the other live
    handle_a.uninstall();
    fa(black_box(4));
    fb(black_box(5));
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 3);

    handle_b.uninstall();
}

#[inline(never)]
extern "C" fn gamma(x: u64) -> u64 {
    x.wrapping_mul(31).wrapping_add(17)
}

#[test]
/// Tests that a second hook on the same address is refused and the first
/// keeps working
fn test_same_address_rejected() {
    let f: extern "C" fn(u64) -> u64 = black_box(gamma);

    let hits = Arc::new(AtomicUsize::new(0));
    let handle = install_at(
        HookDefinition::new("gamma", "gamma").on_enter({
            let hits = Arc::clone(&hits);
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }),
        f as usize,
    );

    let second = HookDefinition::new("gamma_again", "gamma").on_enter(|_| {});
    let result = unsafe { intercept::install(ResolvedHook::new(second, f as usize)) };
    assert!(matches!(
        result,
        Err(AttachError::AlreadyHooked { address }) if address == f as usize
    ));

    assert_eq!(f(black_box(2)), 79);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    handle.uninstall();
}

#[inline(never)]
extern "C" fn delta(x: u64) -> u64 {
    x.rotate_left(11) ^ 0x00ff_00ff
}

#[test]
/// Tests that uninstalling silences the hook, restores the target and frees
/// the address for a new install
fn test_uninstall_and_reinstall() {
    let f: extern "C" fn(u64) -> u64 = black_box(delta);
    let plain = f(black_box(12));

    let first_hits = Arc::new(AtomicUsize::new(0));
    let handle = install_at(
        HookDefinition::new("delta", "delta").on_enter({
            let hits = Arc::clone(&first_hits);
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }),
        f as usize,
    );
    assert_eq!(f(black_box(12)), plain);
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);

    handle.uninstall();
    assert_eq!(f(black_box(12)), plain);
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);

    // the address is free again
    let second_hits = Arc::new(AtomicUsize::new(0));
    let handle = install_at(
        HookDefinition::new("delta_two", "delta").on_enter({
            let hits = Arc::clone(&second_hits);
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }),
        f as usize,
    );
    assert_eq!(f(black_box(12)), plain);
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);

    handle.uninstall();
}

#[inline(never)]
extern "C" fn fib(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib(n - 1).wrapping_add(fib(n - 2))
    }
}

#[test]
/// Tests interception of a recursive target: every level of the call tree
/// enters and leaves in order
fn test_recursive_target() {
    let f: extern "C" fn(u64) -> u64 = black_box(fib);

    let enters = Arc::new(AtomicUsize::new(0));
    let leaves = Arc::new(AtomicUsize::new(0));
    let definition = HookDefinition::new("fib", "fib")
        .on_enter({
            let enters = Arc::clone(&enters);
            move |_| {
                enters.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_leave({
            let leaves = Arc::clone(&leaves);
            move |_| {
                leaves.fetch_add(1, Ordering::SeqCst);
            }
        });
    let handle = install_at(definition, f as usize);

    assert_eq!(f(black_box(6)), 8);
    // fib(6) makes 25 calls in total, each one intercepted
    assert_eq!(enters.load(Ordering::SeqCst), 25);
    assert_eq!(leaves.load(Ordering::SeqCst), 25);

    handle.uninstall();
}

#[inline(never)]
extern "C" fn churn(x: u64) -> u64 {
    x.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(13)
}

#[test]
/// Tests concurrent calls through one hook from many threads
fn test_concurrent_calls() {
    let f: extern "C" fn(u64) -> u64 = black_box(churn);

    let enters = Arc::new(AtomicUsize::new(0));
    let leaves = Arc::new(AtomicUsize::new(0));
    let definition = HookDefinition::new("churn", "churn")
        .on_enter({
            let enters = Arc::clone(&enters);
            move |_| {
                enters.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_leave({
            let leaves = Arc::clone(&leaves);
            move |_| {
                leaves.fetch_add(1, Ordering::SeqCst);
            }
        });
    let handle = install_at(definition, f as usize);

    const THREADS: usize = 8;
    const CALLS: usize = 10_000;
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            thread::spawn(move || {
                for i in 0..CALLS {
                    let x = (t * CALLS + i) as u64;
                    assert_eq!(f(black_box(x)), churn_reference(x));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(enters.load(Ordering::SeqCst), THREADS * CALLS);
    assert_eq!(leaves.load(Ordering::SeqCst), THREADS * CALLS);

    handle.uninstall();
}

/// What `churn` computes, for checking results from worker threads.
fn churn_reference(x: u64) -> u64 {
    x.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(13)
}

#[inline(never)]
extern "C" fn steady(x: u64) -> u64 {
    x.wrapping_add(7)
}

#[test]
/// Tests that a panicking callback is contained and the target still
/// returns its normal result
fn test_panicking_callback_contained() {
    let f: extern "C" fn(u64) -> u64 = black_box(steady);

    let definition = HookDefinition::new("steady", "steady")
        .on_enter(|_| panic!("enter goes boom"))
        .on_leave(|_| panic!("leave goes boom"));
    let handle = install_at(definition, f as usize);

    assert_eq!(f(black_box(42)), 49);
    assert_eq!(f(black_box(0)), 7);

    handle.uninstall();
    assert_eq!(f(black_box(1)), 8);
}

#[inline(never)]
extern "C" fn quiet(x: u64) -> u64 {
    x.wrapping_mul(101).wrapping_add(3)
}

#[test]
/// Tests a hook that only observes returns
fn test_leave_only_hook() {
    let f: extern "C" fn(u64) -> u64 = black_box(quiet);

    let returns = Arc::new(Mutex::new(Vec::new()));
    let definition = HookDefinition::new("quiet", "quiet").on_leave({
        let returns = Arc::clone(&returns);
        move |context| {
            returns
                .lock()
                .unwrap()
                .push(context.return_value().unwrap().to_u64());
        }
    });
    let handle = install_at(definition, f as usize);

    assert_eq!(f(black_box(2)), 205);
    assert_eq!(f(black_box(3)), 306);
    assert_eq!(*returns.lock().unwrap(), [205, 306]);

    handle.uninstall();
}
