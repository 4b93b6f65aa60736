mod chain;
pub(crate) use chain::ChainState;

pub(crate) mod current;

mod coro_context;
pub use coro_context::{CoroContext, CoroSync};
pub(crate) use coro_context::{bind_buffered_stage, bind_value_stage};

mod thread_context;
pub use thread_context::ThreadContext;
