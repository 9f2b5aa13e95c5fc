use gateway_worker::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gateway_shared::logging::init_tracing("gateway-worker");

    let config = AppConfig::load()?;
    config.log_summary();

    // The engine is protocol-agnostic: a deployment build links the chat
    // client crate, wraps it in `transport::ChatTransport`, and calls
    // `worker::run(config, transport)`. This default binary ships without a
    // client compiled in, so refusing to start is a configuration fatal,
    // same as a missing encryption key.
    anyhow::bail!(
        "no chat transport backend linked into this build; \
         start the worker through a deployment binary that provides one"
    )
}
