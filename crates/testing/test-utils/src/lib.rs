use std::str::FromStr;

pub mod sim_clock;

static INIT: std::sync::Once = std::sync::Once::new();

/// Install the test subscriber once per process. Filter with `RUST_LOG`.
pub fn set_up() {
    INIT.call_once(|| {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        std::panic::set_hook(Box::new(utils::tracing_panic_hook));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_test_writer()
            .with_target(true);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    });
}

pub fn env_or_default<T: FromStr>(env_var: &str, default: T) -> T {
    std::env::var(env_var)
        .ok()
        .and_then(|val| str::parse(&val).ok())
        .unwrap_or(default)
}
