//! Embedded QuickJS interpreter owned by one session

use super::bridge::Bridge;
use super::capability::Capability;
use crate::config::SandboxConfig;
use rquickjs::{CatchResultExt, CaughtError, Context, FromJs, Function, Runtime};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A configured interpreter. Never reused across sessions.
pub(crate) struct Interpreter {
    context: Context,
    _runtime: Runtime,
}

impl Interpreter {
    /// Create an interpreter with the configured memory and stack ceilings.
    ///
    /// Evaluation aborts with an uncatchable error as soon as `interrupt`
    /// is raised.
    pub(crate) fn new(config: &SandboxConfig, interrupt: Arc<AtomicBool>) -> rquickjs::Result<Self> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(config.max_memory);
        runtime.set_max_stack_size(config.max_stack_size);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.load(Ordering::SeqCst))));

        let context = Context::full(&runtime)?;
        Ok(Self {
            context,
            _runtime: runtime,
        })
    }

    /// Expose every capability as a global taking and returning JSON text
    pub(crate) fn register(&self, bridge: &Rc<Bridge>) -> rquickjs::Result<()> {
        self.context.with(|ctx| {
            let globals = ctx.globals();
            for &capability in Capability::all() {
                let bridge = Rc::clone(bridge);
                let function = Function::new(ctx.clone(), move |args: String| -> String {
                    bridge.call(capability, &args)
                })?;
                globals.set(capability.global_name(), function)?;
            }
            Ok(())
        })
    }

    /// Evaluate guest source; failures carry the guest-visible message
    pub(crate) fn eval<T>(&self, source: &str) -> Result<T, String>
    where
        T: for<'js> FromJs<'js>,
    {
        self.context.with(|ctx| {
            ctx.eval::<T, _>(source)
                .catch(&ctx)
                .map_err(caught_message)
        })
    }
}

fn caught_message(error: CaughtError<'_>) -> String {
    match error {
        CaughtError::Exception(exception) => exception
            .message()
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| "Uncaught exception".to_string()),
        CaughtError::Value(value) => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .unwrap_or_else(|| "Uncaught non-error value".to_string()),
        CaughtError::Error(error) => error.to_string(),
    }
}
