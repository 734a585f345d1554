use asyn_log::Level;

#[test]
fn test_log() {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .init();

    asyn_log::debug!("debug");
    asyn_log::error!("error");
    asyn_log::event!(Level::DEBUG, "event");
    asyn_log::info!("info");
    asyn_log::warn!("warn");
    asyn_log::trace!("trace");
}
