use once_cell::sync::Lazy;

use crate::{ProxySelector, TransportConfig};

mod pool;
mod retry;
mod timeout;

pub(crate) fn init_test_log() {
    static INIT_LOG: Lazy<()> = Lazy::new(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
    *INIT_LOG
}

/// Base transport config for tests: never consult the proxy
/// environment (a concurrently-running proxy test may be mutating it).
pub(crate) fn test_config() -> TransportConfig {
    TransportConfig {
        proxy: ProxySelector::None,
        ..Default::default()
    }
}

/// Give the read loop a moment to recycle a drained connection before
/// asserting on pool state.
pub(crate) fn settle() {
    std::thread::sleep(std::time::Duration::from_millis(80));
}
