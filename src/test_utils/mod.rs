#![allow(unused)]

use crate::context::ChainState;
use crate::errors::DispatcherError;
use crate::future::Promise;
use crate::queue::QueueId;
use crate::task::{IoTask, Task, TaskType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

const TEST_CORO_STACK_SIZE: usize = 64 * 1024;

pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A task with a trivial body, for exercising queues without a dispatcher.
pub(crate) fn noop_task(queue_id: usize) -> Arc<Task> {
    let chain = ChainState::new(Weak::new());
    let stage = chain.push_promise(Arc::new(Promise::<i32>::new()));
    // The body keeps the chain alive for the task's lifetime, as the real
    // stage binders do.
    let body_chain = chain.clone();
    Task::new(
        &chain,
        stage,
        TaskType::First,
        QueueId::Id(queue_id),
        false,
        TEST_CORO_STACK_SIZE,
        move |_yielder, ()| {
            let _chain = &body_chain;
            Ok(())
        },
    )
    .expect("failed to build test task")
}

pub(crate) fn noop_io_task() -> Arc<IoTask> {
    Arc::new(IoTask::new(QueueId::Any, false, Box::new(|| Ok(()))))
}

/// A flag that gated task bodies spin-yield on, releasing them from the
/// outside.
#[derive(Clone, Default)]
pub(crate) struct Gate(Arc<AtomicBool>);

impl Gate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
