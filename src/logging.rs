/// Install the JSON tracing subscriber used by the command line surface.
///
/// The filter comes from `TENANT_LIFECYCLE_LOG`. `log` records emitted by
/// dependencies are bridged into tracing. Calling this twice is harmless.
pub fn init() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("TENANT_LIFECYCLE_LOG")
                .unwrap_or_else(|_| "tenant_lifecycle=info,sqlx=warn".into()),
        )
        .json()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .try_init();
}
