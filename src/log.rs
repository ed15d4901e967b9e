/// Initialize logging, if enabled.
///
/// This runs before the process-wide runtime adopts the main thread, so
/// that the message announcing the main thread can be seen.
pub(crate) fn init() {
    // Initialize the chosen logger. Someone else may have installed one
    // already, in which case we leave theirs in place.
    #[cfg(feature = "env_logger")]
    let _ = env_logger::try_init();

    #[cfg(feature = "log")]
    log::trace!(target: "spindle::program", "Runtime initializing");
}
