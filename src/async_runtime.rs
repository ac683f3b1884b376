//! Builds the single-worker-thread Tokio runtime that backs each
//! endpoint's reactor thread — one reactor, driving every async
//! completion for that endpoint, matching the source's single-threaded
//! ASIO `io_context`.

use tokio::runtime::Runtime;

pub fn build_reactor_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("meshlink-reactor")
        .enable_all()
        .build()
}
