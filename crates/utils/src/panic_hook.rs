use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

/// Panic hook that reports the panic through `tracing`, falling back to stderr
/// when no subscriber would record an error event.
pub fn tracing_panic_hook(panic_info: &PanicHookInfo) {
    let payload = panic_payload(panic_info);
    let location = panic_info.location().map(ToString::to_string);
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");
    let backtrace = Backtrace::capture();
    let backtrace = (backtrace.status() == BacktraceStatus::Captured).then_some(backtrace);

    if tracing::enabled!(tracing::Level::ERROR) {
        match &backtrace {
            Some(backtrace) => tracing::error!(
                panic.payload = payload,
                panic.location = location,
                panic.thread = thread_name,
                "A panic occurred: {backtrace}"
            ),
            None => tracing::error!(
                panic.payload = payload,
                panic.location = location,
                panic.thread = thread_name,
                "A panic occurred"
            ),
        }
        return;
    }
    let payload = payload.unwrap_or("<no payload>");
    let location = location.as_deref().unwrap_or("<unknown location>");
    match backtrace {
        Some(backtrace) => {
            eprintln!("Thread `{thread_name}` panicked at {location}: {payload}\n{backtrace}");
        }
        None => eprintln!("Thread `{thread_name}` panicked at {location}: {payload}"),
    }
}

fn panic_payload<'a>(panic_info: &'a PanicHookInfo) -> Option<&'a str> {
    let payload = panic_info.payload();
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}
