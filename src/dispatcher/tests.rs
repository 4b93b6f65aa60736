use super::*;
use crate::context::CoroContext;
use crate::errors::DispatcherError;
use crate::future::WaitStatus;
use crate::queue::{QueueId, QueueStatistics, QueueType};
use crate::test_utils::{Gate, init_tracing};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::{assert_impl_all, assert_not_impl_any};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Dispatcher: Send, Sync);
assert_impl_all!(crate::ThreadContext<i32>: Send, Sync);
assert_impl_all!(crate::Future<i32>: Send, Sync);
// Yield handles must never leave their task.
assert_not_impl_any!(crate::CoroSync: Send, Sync);

/// Body that spin-yields until the gate opens, keeping its queue
/// observably busy, then resolves to 1.
fn spinner(gate: Gate) -> impl FnOnce(&CoroContext<i32>) -> Result<i32> + Send + 'static {
    move |ctx| {
        while !gate.is_open() {
            ctx.yield_now()?;
        }
        Ok(1)
    }
}

/// Body that occupies its worker without cooperatively yielding until the
/// gate opens. Everything posted meanwhile stacks up behind it in queue
/// order.
fn holder(gate: Gate) -> impl FnOnce(&CoroContext<i32>) -> Result<i32> + Send + 'static {
    move |_ctx| {
        while !gate.is_open() {
            thread::yield_now();
        }
        Ok(1)
    }
}

// --- Construction boundaries ---

#[rstest]
#[case::zero_clamps_to_one(0, 1)]
#[case::one(1, 1)]
#[case::explicit(3, 3)]
fn builder_resolves_coroutine_thread_counts(
    #[case] requested: i32,
    #[case] expected: usize,
) -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(requested)
        .num_io_threads(1)
        .try_build()?;
    assert_eq!(dispatcher.num_coroutine_threads(), expected);
    Ok(())
}

#[test]
fn minus_one_means_one_worker_per_core() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(-1)
        .num_io_threads(1)
        .try_build()?;
    let expected = thread::available_parallelism().map_or(1, |n| n.get());
    assert_eq!(dispatcher.num_coroutine_threads(), expected);
    Ok(())
}

#[test]
fn coroutine_thread_counts_below_minus_one_are_rejected() {
    assert!(matches!(
        Builder::new().num_coroutine_threads(-5).try_build(),
        Err(DispatcherError::InvalidArgument(_))
    ));
}

#[rstest]
#[case::zero(0, 1)]
#[case::negative(-4, 1)]
#[case::explicit(2, 2)]
fn io_thread_counts_are_clamped_to_at_least_one(
    #[case] requested: i32,
    #[case] expected: usize,
) -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(requested)
        .try_build()?;
    assert_eq!(dispatcher.num_io_threads(), expected);
    Ok(())
}

#[test]
fn default_any_range_covers_all_queues() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(10)
        .num_io_threads(1)
        .try_build()?;
    assert_eq!(dispatcher.coro_queue_id_range_for_any(), (0, 10));
    Ok(())
}

#[rstest]
#[case::valid_narrow(2, 3, (2, 3))]
#[case::valid_wide(1, 8, (1, 8))]
#[case::empty(1, 1, (0, 10))]
#[case::inverted(1, 0, (0, 10))]
#[case::inverted_high(10, 9, (0, 10))]
#[case::out_of_bounds(20, 30, (0, 10))]
fn any_range_falls_back_when_invalid_or_empty(
    #[case] lo: usize,
    #[case] hi: usize,
    #[case] expected: (usize, usize),
) -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(10)
        .num_io_threads(1)
        .coro_queue_id_range_for_any(lo, hi)
        .try_build()?;
    assert_eq!(dispatcher.coro_queue_id_range_for_any(), expected);
    Ok(())
}

// --- Chain laws ---

#[test]
fn single_stage_chain_behaves_like_a_plain_call() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;
    let ctx = dispatcher
        .post_first(|_: &CoroContext<i32>| Ok(42))?
        .end()?;
    assert_eq!(ctx.get()?, 42);
    assert_eq!(ctx.get_ref_at::<i32, i32>(0, |v| *v * 2)?, 84);
    Ok(())
}

#[test]
fn continuations_can_wait_on_any_earlier_stage() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher
        .post_first(|_: &CoroContext<i32>| Ok(10))?
        .then(|ctx: &CoroContext<i32>| Ok(ctx.get_prev::<i32>()? * 2))?
        .then(|ctx: &CoroContext<i32>| {
            ctx.wait_all()?;
            ctx.wait_at(0)?;
            assert_eq!(
                ctx.wait_for_at(-1, Duration::from_millis(5))?,
                WaitStatus::Ready
            );
            let doubled = ctx.get_ref_at::<i32, i32>(1, |v| *v)?;
            Ok(ctx.get_at::<i32>(0)? + doubled)
        })?
        .end()?;

    assert_eq!(ctx.get()?, 30);
    Ok(())
}

#[test]
fn early_set_wins_over_the_returned_value() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;
    let ctx = dispatcher.post(|ctx: &CoroContext<i32>| {
        ctx.set(9)?;
        assert!(matches!(
            ctx.set(10),
            Err(DispatcherError::PromiseAlreadySet)
        ));
        // Discarded: the stage promise already carries 9.
        Ok(0)
    })?;
    assert_eq!(ctx.get()?, 9);
    Ok(())
}

#[test]
fn hundred_chains_resolve_and_queues_drain() -> Result<()> {
    init_tracing();
    let dispatcher = Builder::new()
        .num_coroutine_threads(2)
        .num_io_threads(1)
        .try_build()?;

    let mut chains = Vec::new();
    for _ in 0..100 {
        let ctx = dispatcher
            .post_first(|_: &CoroContext<i32>| Ok(1))?
            .then(|ctx: &CoroContext<i32>| Ok(ctx.get_prev::<i32>()? + 1))?
            .finally(|ctx: &CoroContext<i32>| Ok(ctx.get_prev::<i32>()?))?
            .end()?;
        chains.push(ctx);
    }

    for ctx in &chains {
        assert_eq!(ctx.get()?, 2);
    }

    dispatcher.drain(Duration::ZERO);
    assert_eq!(dispatcher.size(QueueType::All, QueueId::All)?, 0);

    dispatcher.reset_stats();
    assert_eq!(
        dispatcher.stats(QueueType::All, QueueId::All)?,
        QueueStatistics::default()
    );
    Ok(())
}

#[test]
fn error_handler_recovers_the_chain() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher
        .post_first(|_: &CoroContext<i32>| Err(anyhow!("boom")))?
        .on_error(|_: &CoroContext<i32>| Ok(7))?
        .finally(|ctx: &CoroContext<i32>| Ok(ctx.get_prev::<i32>()?))?
        .end()?;

    assert_eq!(ctx.get()?, 7);
    ctx.wait_all()?;
    // The failing stage's promise carries the original error.
    assert!(matches!(
        ctx.get_at::<i32>(0),
        Err(DispatcherError::User(_))
    ));
    Ok(())
}

#[test]
fn exceptions_skip_continuations_until_a_handler_or_final() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher
        .post_first(|_: &CoroContext<i32>| Err(anyhow!("boom")))?
        .then(|ctx: &CoroContext<i32>| Ok(ctx.get_prev::<i32>()? + 1))?
        .finally(|_: &CoroContext<i32>| Ok(99))?
        .end()?;

    assert_eq!(ctx.get()?, 99);
    // The skipped continuation was failed with the propagated error.
    assert!(matches!(
        ctx.get_at::<i32>(1),
        Err(DispatcherError::User(_))
    ));
    Ok(())
}

#[test]
fn skipped_error_handlers_are_released_on_success() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher
        .post_first(|_: &CoroContext<i32>| Ok(1))?
        .on_error(|_: &CoroContext<i32>| Ok(-1))?
        .finally(|ctx: &CoroContext<i32>| Ok(ctx.get_at::<i32>(0)?))?
        .end()?;

    assert_eq!(ctx.get()?, 1);
    assert!(matches!(
        ctx.get_at::<i32>(1),
        Err(DispatcherError::Terminated)
    ));
    Ok(())
}

#[test]
fn unhandled_errors_surface_on_the_last_stage() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher
        .post_first(|_: &CoroContext<i32>| Err(anyhow!("no handler anywhere")))?
        .then(|ctx: &CoroContext<i32>| Ok(ctx.get_prev::<i32>()? + 1))?
        .end()?;

    assert!(matches!(ctx.get(), Err(DispatcherError::User(_))));
    Ok(())
}

#[test]
fn panics_propagate_as_task_errors() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher.post(|_: &CoroContext<i32>| -> Result<i32> { panic!("kaboom") })?;
    match ctx.get() {
        Err(DispatcherError::User(err)) => assert!(err.to_string().contains("kaboom")),
        other => panic!("expected a task error, got {other:?}"),
    }
    Ok(())
}

// --- Structural misuse ---

#[test]
fn standalone_contexts_cannot_chain() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;
    let standalone = dispatcher.post(|_: &CoroContext<i32>| Ok(1))?;
    assert!(matches!(
        standalone.then(|_: &CoroContext<i32>| Ok(2)),
        Err(DispatcherError::ChainClosed)
    ));
    Ok(())
}

#[test]
fn a_chain_admits_a_single_finally() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;
    let chain = dispatcher
        .post_first(|_: &CoroContext<i32>| Ok(1))?
        .finally(|ctx: &CoroContext<i32>| Ok(ctx.get_prev::<i32>()?))?;
    assert!(matches!(
        chain.finally(|_: &CoroContext<i32>| Ok(0)),
        Err(DispatcherError::ChainClosed)
    ));
    Ok(())
}

#[test]
fn nothing_may_follow_the_finally() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;
    let chain = dispatcher
        .post_first(|_: &CoroContext<i32>| Ok(1))?
        .finally(|ctx: &CoroContext<i32>| Ok(ctx.get_prev::<i32>()?))?;
    assert!(matches!(
        chain.then(|_: &CoroContext<i32>| Ok(0)),
        Err(DispatcherError::ChainClosed)
    ));
    Ok(())
}

#[test]
fn appending_after_end_is_rejected() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;
    let done = dispatcher
        .post_first(|_: &CoroContext<i32>| Ok(1))?
        .end()?;
    assert!(matches!(
        done.then(|_: &CoroContext<i32>| Ok(0)),
        Err(DispatcherError::ChainClosed)
    ));
    Ok(())
}

#[test]
fn invalid_queue_targets_are_rejected_synchronously() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(2)
        .num_io_threads(2)
        .try_build()?;

    assert!(matches!(
        dispatcher.post_on::<i32, _>(QueueId::Id(99), false, |_| Ok(1)),
        Err(DispatcherError::InvalidQueueId { .. })
    ));
    assert!(matches!(
        dispatcher.post_on::<i32, _>(QueueId::All, false, |_| Ok(1)),
        Err(DispatcherError::InvalidQueueId { .. })
    ));
    assert!(matches!(
        dispatcher.post_async_io_on::<i32, _>(QueueId::Id(42), false, || Ok(1)),
        Err(DispatcherError::InvalidQueueId { .. })
    ));
    Ok(())
}

#[test]
fn query_sentinels_are_validated() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(2)
        .num_io_threads(1)
        .try_build()?;

    // `All` type cannot be combined with a real queue id.
    assert!(matches!(
        dispatcher.size(QueueType::All, QueueId::Id(0)),
        Err(DispatcherError::InvalidArgument(_))
    ));
    // `Any` is only meaningful for I/O queries.
    assert!(matches!(
        dispatcher.size(QueueType::Coro, QueueId::Any),
        Err(DispatcherError::InvalidQueueId { .. })
    ));
    assert_eq!(dispatcher.size(QueueType::Io, QueueId::Any)?, 0);
    Ok(())
}

// --- Routing ---

#[test]
fn any_routing_on_an_idle_dispatcher_targets_queue_zero() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(3)
        .num_io_threads(1)
        .try_build()?;
    let ctx = dispatcher.post(|_: &CoroContext<i32>| Ok(1))?;
    assert_eq!(ctx.get()?, 1);
    assert_eq!(
        dispatcher
            .stats(QueueType::Coro, QueueId::Id(0))?
            .posted_count,
        1
    );
    Ok(())
}

#[test]
fn any_routing_balances_across_the_configured_range() -> Result<()> {
    init_tracing();
    let dispatcher = Builder::new()
        .num_coroutine_threads(4)
        .num_io_threads(1)
        .coro_queue_id_range_for_any(1, 4)
        .try_build()?;
    assert_eq!(dispatcher.coro_queue_id_range_for_any(), (1, 4));

    let gate = Gate::new();
    let mut contexts = Vec::new();

    // Keep queues 1..=3 observably busy so `Any` routing sees their sizes.
    for queue in 1..4 {
        contexts.push(dispatcher.post_on(QueueId::Id(queue), false, spinner(gate.clone()))?);
    }
    for _ in 0..12 {
        contexts.push(dispatcher.post(spinner(gate.clone()))?);
    }

    assert_eq!(
        dispatcher
            .stats(QueueType::Coro, QueueId::Id(0))?
            .posted_count,
        0,
        "queue 0 is outside the range and must receive nothing"
    );
    for queue in 1..4 {
        assert_eq!(
            dispatcher
                .stats(QueueType::Coro, QueueId::Id(queue))?
                .posted_count,
            5,
            "one pinned spinner plus four balanced submissions"
        );
    }

    gate.open();
    for ctx in &contexts {
        assert_eq!(ctx.get()?, 1);
    }
    dispatcher.drain(Duration::ZERO);
    assert_eq!(dispatcher.size(QueueType::All, QueueId::All)?, 0);
    Ok(())
}

#[test]
fn high_priority_tasks_run_ahead_of_queued_normal_ones() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let gate = Gate::new();
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    // Occupy the worker so both submissions below are ordered behind it.
    let blocker = dispatcher.post_on(QueueId::Id(0), false, holder(gate.clone()))?;

    let normal = {
        let events = events.clone();
        dispatcher.post_on(QueueId::Id(0), false, move |_: &CoroContext<i32>| {
            events.lock().push("normal");
            Ok(1)
        })?
    };
    let urgent = {
        let events = events.clone();
        dispatcher.post_on(QueueId::Id(0), true, move |_: &CoroContext<i32>| {
            events.lock().push("urgent");
            Ok(1)
        })?
    };

    gate.open();
    normal.wait()?;
    urgent.wait()?;
    blocker.wait()?;

    let events = events.lock();
    let urgent_at = events.iter().position(|e| *e == "urgent").unwrap();
    let normal_at = events.iter().position(|e| *e == "normal").unwrap();
    assert!(urgent_at < normal_at);
    Ok(())
}

#[test]
fn chains_on_the_same_queue_run_in_submission_order() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(2)
        .num_io_threads(1)
        .try_build()?;

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let chain_a = {
        let events = events.clone();
        dispatcher
            .post_first_on(QueueId::Id(0), false, move |_: &CoroContext<i32>| {
                events.lock().push("a_start");
                events.lock().push("a_end");
                Ok(1)
            })?
            .end()?
    };
    let chain_b = {
        let events = events.clone();
        dispatcher
            .post_first_on(QueueId::Id(0), false, move |_: &CoroContext<i32>| {
                events.lock().push("b_start");
                Ok(2)
            })?
            .end()?
    };

    assert_eq!(chain_a.get()?, 1);
    assert_eq!(chain_b.get()?, 2);

    let events = events.lock();
    let a_end = events.iter().position(|e| *e == "a_end").unwrap();
    let b_start = events.iter().position(|e| *e == "b_start").unwrap();
    assert!(a_end < b_start, "B's first stage started before A completed");
    Ok(())
}

// --- Blocking I/O ---

#[test]
fn io_results_arrive_through_the_future() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(2)
        .try_build()?;
    let future = dispatcher.post_async_io(|| Ok(41 + 1))?;
    assert_eq!(future.get()?, 42);
    Ok(())
}

#[test]
fn io_errors_fail_the_future() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;
    let future = dispatcher.post_async_io::<i32, _>(|| Err(anyhow!("disk on fire")))?;
    assert!(matches!(future.get(), Err(DispatcherError::User(_))));
    Ok(())
}

#[test]
fn pinned_io_tasks_run_on_their_affine_queue() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(3)
        .try_build()?;
    let future = dispatcher.post_async_io_on(QueueId::Id(1), false, || Ok(5))?;
    assert_eq!(future.get()?, 5);
    assert_eq!(
        dispatcher
            .stats(QueueType::Io, QueueId::Id(1))?
            .posted_count,
        1
    );
    Ok(())
}

#[test]
fn shared_io_posts_funnel_through_queue_zero_and_wake_every_worker() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(3)
        .try_build()?;

    let mut futures = Vec::new();
    for _ in 0..10 {
        futures.push(dispatcher.post_async_io(|| Ok(1))?);
    }

    // All `Any` submissions land on the shared pool, none on affine queues.
    assert_eq!(
        dispatcher.stats(QueueType::Io, QueueId::Any)?.posted_count,
        10
    );
    for queue in 0..3 {
        let stats = dispatcher.stats(QueueType::Io, QueueId::Id(queue))?;
        assert_eq!(stats.posted_count, 0);
        assert_eq!(
            stats.signal_count, 10,
            "each affine worker observes exactly one wake signal per post"
        );
    }

    for future in &futures {
        assert_eq!(future.get()?, 1);
    }
    Ok(())
}

#[test]
fn load_balanced_io_spreads_across_the_shared_pool() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(2)
        .load_balance_shared_io_queues(true)
        .try_build()?;

    let mut futures = Vec::new();
    for _ in 0..8 {
        futures.push(dispatcher.post_async_io(|| Ok(1))?);
    }
    for future in &futures {
        assert_eq!(future.get()?, 1);
    }
    // Round-robin admission across the shared queues.
    assert_eq!(
        dispatcher.stats(QueueType::Io, QueueId::Any)?.posted_count,
        8
    );
    Ok(())
}

// --- Context validation ---

#[test]
fn thread_blocking_waits_inside_a_coroutine_are_rejected() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher.post(|ctx: &CoroContext<bool>| {
        let future = ctx.post_async_io(|| Ok(5))?;
        // The thread-waiting form must fail synchronously from in here.
        assert!(matches!(future.get(), Err(DispatcherError::BadContext)));
        // The coroutine-waiting form is the right tool.
        assert_eq!(future.get_coro(ctx.sync())?, 5);
        Ok(true)
    })?;

    assert!(ctx.get()?);
    Ok(())
}

#[test]
fn nested_posts_compose_through_coroutine_waits() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(2)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher.post(|ctx: &CoroContext<i32>| {
        let standalone = ctx.post(|_: &CoroContext<i32>| Ok(3))?;
        let chained = ctx.post_first(|_: &CoroContext<i32>| Ok(4))?.end()?;
        Ok(standalone.get_coro(ctx.sync())? + chained.get_coro(ctx.sync())?)
    })?;

    assert_eq!(ctx.get()?, 7);
    Ok(())
}

#[test]
fn coroutine_timed_waits_poll_across_yields() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher.post(|ctx: &CoroContext<bool>| {
        let slow = ctx.post_async_io(|| {
            thread::sleep(Duration::from_millis(80));
            Ok(2)
        })?;
        assert_eq!(
            slow.wait_for_coro(ctx.sync(), Duration::from_millis(5))?,
            WaitStatus::Timeout
        );
        assert_eq!(slow.get_coro(ctx.sync())?, 2);
        Ok(true)
    })?;

    assert!(ctx.get()?);
    Ok(())
}

#[test]
fn thread_timed_waits_report_timeout_then_ready() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let gate = Gate::new();
    let ctx = dispatcher.post(spinner(gate.clone()))?;
    assert_eq!(
        ctx.wait_for(Duration::from_millis(30))?,
        WaitStatus::Timeout
    );

    gate.open();
    assert_eq!(ctx.get()?, 1);
    Ok(())
}

#[test]
fn cooperative_sleep_suspends_without_blocking_the_worker() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let start = Instant::now();
    let sleeper = dispatcher.post(|ctx: &CoroContext<i32>| {
        ctx.sleep(Duration::from_millis(40))?;
        Ok(1)
    })?;
    // The same worker keeps serving other tasks while the sleeper is down.
    let bystander = dispatcher.post(|_: &CoroContext<i32>| Ok(2))?;

    assert_eq!(bystander.get()?, 2);
    assert!(start.elapsed() < Duration::from_millis(40));
    assert_eq!(sleeper.get()?, 1);
    assert!(start.elapsed() >= Duration::from_millis(40));
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn worker_threads_carry_the_configured_names() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;
    let ctx = dispatcher.post(|_: &CoroContext<String>| {
        crate::utils::thread::get_current_thread_name()
    })?;
    assert!(ctx.get()?.starts_with("weft-coro-"));
    Ok(())
}

// --- Buffer mode ---

#[test]
fn buffered_stage_streams_into_the_next_stage() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(2)
        .num_io_threads(1)
        .try_build()?;

    let ctx = dispatcher
        .post_first_buffered(|ctx: &CoroContext<i32>| {
            for value in 1..=5 {
                ctx.push(value)?;
            }
            // The buffer closes implicitly on return.
            Ok(())
        })?
        .then(|ctx: &CoroContext<Vec<i32>>| {
            let mut values = Vec::new();
            while let Some(value) = ctx.pull_prev::<i32>()? {
                values.push(value);
            }
            Ok(values)
        })?
        .end()?;

    assert_eq!(ctx.get()?, vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn bounded_buffers_backpressure_the_producer() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .buffer_capacity(2)
        .try_build()?;

    let ctx = dispatcher
        .post_first_buffered(|ctx: &CoroContext<i32>| {
            for value in 0..5 {
                ctx.push(value)?;
            }
            Ok(())
        })?
        .end()?;

    // Thread-side consumer drains the stream while the producer blocks on
    // the 2-slot buffer.
    let mut values = Vec::new();
    while let Some(value) = ctx.pull()? {
        values.push(value);
    }
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
    Ok(())
}

// --- Termination & drain ---

#[test]
fn pinned_workers_still_serve_tasks() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(2)
        .num_io_threads(1)
        .pin_coroutine_threads_to_cores(true)
        .try_build()?;
    assert_eq!(dispatcher.post(|_: &CoroContext<i32>| Ok(3))?.get()?, 3);
    Ok(())
}

#[test]
fn terminate_is_idempotent_and_rejects_new_work() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(2)
        .num_io_threads(1)
        .try_build()?;
    dispatcher.terminate();
    dispatcher.terminate();

    assert!(matches!(
        dispatcher.post(|_: &CoroContext<i32>| Ok(1)),
        Err(DispatcherError::Terminated)
    ));
    assert!(matches!(
        dispatcher.post_async_io::<i32, _>(|| Ok(1)),
        Err(DispatcherError::Terminated)
    ));
    assert_eq!(dispatcher.size(QueueType::All, QueueId::All)?, 0);
    Ok(())
}

#[test]
fn terminate_reaps_perpetually_yielding_tasks() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    // The gate never opens; the spinner would yield forever.
    let ctx = dispatcher.post(spinner(Gate::new()))?;
    dispatcher.terminate();
    assert!(ctx.get().is_err());
    Ok(())
}

#[test]
fn context_terminate_unblocks_waiters() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let gate = Gate::new();
    let ctx = dispatcher.post(spinner(gate.clone()))?;
    ctx.terminate();
    assert!(matches!(ctx.get(), Err(DispatcherError::Terminated)));

    // The body itself is not interrupted; release it for shutdown.
    gate.open();
    dispatcher.drain(Duration::ZERO);
    Ok(())
}

#[test]
fn drain_disables_posting_from_outside() -> Result<()> {
    let dispatcher = Arc::new(
        Builder::new()
            .num_coroutine_threads(1)
            .num_io_threads(1)
            .try_build()?,
    );

    let gate = Gate::new();
    let busy = dispatcher.post(spinner(gate.clone()))?;

    let drainer = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.drain(Duration::ZERO))
    };

    // Give the drainer time to raise the flag.
    thread::sleep(Duration::from_millis(50));
    assert!(matches!(
        dispatcher.post(|_: &CoroContext<i32>| Ok(1)),
        Err(DispatcherError::PostingDisabled)
    ));

    gate.open();
    drainer.join().unwrap();
    assert_eq!(busy.get()?, 1);

    // Posting works again once the drain is over.
    assert_eq!(dispatcher.post(|_: &CoroContext<i32>| Ok(1))?.get()?, 1);
    Ok(())
}

#[test]
fn drain_respects_its_timeout() -> Result<()> {
    let dispatcher = Builder::new()
        .num_coroutine_threads(1)
        .num_io_threads(1)
        .try_build()?;

    let gate = Gate::new();
    let busy = dispatcher.post(spinner(gate.clone()))?;

    let start = Instant::now();
    dispatcher.drain(Duration::from_millis(40));
    assert!(start.elapsed() >= Duration::from_millis(40));

    gate.open();
    assert_eq!(busy.get()?, 1);
    Ok(())
}
